//! End-to-end tests for the provman command-line binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use provman_schema::Platform;
use serde_json::Value;
use tempfile::TempDir;

/// Isolated home, working directory and filesystem mirror for one test.
struct TestContext {
    temp_dir: TempDir,
    home: PathBuf,
    workdir: PathBuf,
    mirror: PathBuf,
}

impl TestContext {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let home = temp_dir.path().join(".provman");
        let workdir = temp_dir.path().join("work");
        let mirror = temp_dir.path().join("mirror");
        for dir in [&home, &workdir, &mirror] {
            fs::create_dir_all(dir).expect("failed to create dir");
        }
        Self {
            temp_dir,
            home,
            workdir,
            mirror,
        }
    }

    /// A context whose only source is the local mirror, holding `null` 3.2.0.
    fn with_mirror() -> Self {
        let ctx = Self::new();
        let package = ctx
            .mirror
            .join("registry.opentofu.org/hashicorp/null/3.2.0")
            .join(Platform::current().to_string());
        fs::create_dir_all(&package).unwrap();
        fs::write(package.join("terraform-provider-null_v3.2.0"), b"#!/bin/sh\n").unwrap();

        fs::write(
            ctx.home.join("config.toml"),
            format!(
                "[[source]]\nkind = \"filesystem_mirror\"\npath = {:?}\n",
                ctx.mirror.display().to_string()
            ),
        )
        .unwrap();
        ctx.require("[required_providers.null]\nversion = \"~> 3.0\"\n");
        ctx
    }

    fn require(&self, manifest: &str) {
        fs::write(self.workdir.join("provman.toml"), manifest).unwrap();
    }

    fn lock_path(&self) -> PathBuf {
        self.workdir.join("provman.lock")
    }

    fn cmd(&self) -> Command {
        self.cmd_in(&self.workdir)
    }

    fn cmd_in(&self, workdir: &Path) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_provman"));
        cmd.env("HOME", self.temp_dir.path());
        cmd.env("PROVMAN_HOME", &self.home);
        cmd.env_remove("PROVMAN_CONFIG_FILE");
        cmd.env_remove("PROVMAN_PLUGIN_CACHE_DIR");
        cmd.env_remove("RUST_LOG");
        cmd.arg("-C").arg(workdir);
        cmd
    }

    fn run(&self, args: &[&str]) -> Output {
        self.cmd().args(args).output().expect("failed to run provman")
    }

    fn run_json(&self, args: &[&str]) -> (bool, Value) {
        let mut args = args.to_vec();
        args.push("--json");
        let output = self.run(&args);
        let value = serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
            panic!(
                "stdout is not JSON ({e}): {}\nstderr: {}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            )
        });
        (output.status.success(), value)
    }
}

fn package_dir_in(workdir: &Path) -> PathBuf {
    workdir
        .join(".provman/providers/registry.opentofu.org/hashicorp/null/3.2.0")
        .join(Platform::current().to_string())
}

#[test]
fn test_help_command() {
    let ctx = TestContext::new();
    let output = ctx.run(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage:"));
    assert!(stdout.contains("init"));
}

#[test]
fn test_version_command() {
    let ctx = TestContext::new();
    assert!(ctx.run(&["--version"]).status.success());
}

#[test]
fn test_init_installs_and_locks() {
    let ctx = TestContext::with_mirror();

    let (ok, summary) = ctx.run_json(&["init"]);
    assert!(ok, "{summary}");
    assert_eq!(summary["lock_written"], true);
    assert_eq!(summary["fetched"], 1);
    assert_eq!(summary["providers"][0]["provider"], "registry.opentofu.org/hashicorp/null");
    assert_eq!(summary["providers"][0]["version"], "3.2.0");
    assert!(package_dir_in(&ctx.workdir).join("terraform-provider-null_v3.2.0").exists());

    let lock = fs::read_to_string(ctx.lock_path()).unwrap();
    assert!(lock.contains("registry.opentofu.org/hashicorp/null"));
    assert!(lock.contains("h1:"));

    // Second run is served from the cache and leaves the lock alone.
    let (ok, summary) = ctx.run_json(&["init"]);
    assert!(ok, "{summary}");
    assert_eq!(summary["lock_written"], false);
    assert_eq!(summary["fetched"], 0);
    assert_eq!(fs::read_to_string(ctx.lock_path()).unwrap(), lock);

    let (ok, rows) = ctx.run_json(&["verify"]);
    assert!(ok, "{rows}");
    assert_eq!(rows[0]["version"], "3.2.0");
}

#[test]
fn test_verify_without_lock_suggests_init() {
    let ctx = TestContext::with_mirror();

    let (ok, out) = ctx.run_json(&["verify"]);
    assert!(!ok);
    assert_eq!(out["error"]["kind"], "no_version_selected");
    assert_eq!(out["error"]["remediation"]["command"], "provman init");

    let output = ctx.run(&["verify"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("provman init"), "{stderr}");
}

#[test]
fn test_verify_detects_tampering() {
    let ctx = TestContext::with_mirror();
    assert!(ctx.run(&["init"]).status.success());

    let exe = package_dir_in(&ctx.workdir).join("terraform-provider-null_v3.2.0");
    fs::write(&exe, b"#!/bin/sh\necho pwned\n").unwrap();

    let (ok, out) = ctx.run_json(&["verify"]);
    assert!(!ok);
    assert_eq!(out["error"]["kind"], "tampered_package");
    assert!(
        out["error"]["message"]
            .as_str()
            .unwrap()
            .contains(&package_dir_in(&ctx.workdir).display().to_string())
    );
}

#[test]
fn test_cache_list_and_clear() {
    let ctx = TestContext::with_mirror();

    let (ok, rows) = ctx.run_json(&["cache", "list"]);
    assert!(ok);
    assert_eq!(rows, Value::Array(Vec::new()));

    assert!(ctx.run(&["init"]).status.success());
    let (_, rows) = ctx.run_json(&["cache", "list"]);
    assert_eq!(rows.as_array().unwrap().len(), 1);
    assert_eq!(rows[0]["version"], "3.2.0");

    assert!(ctx.run(&["cache", "clear"]).status.success());
    let (_, rows) = ctx.run_json(&["cache", "list"]);
    assert_eq!(rows, Value::Array(Vec::new()));

    let (ok, out) = ctx.run_json(&["cache", "list", "--global"]);
    assert!(!ok);
    assert_eq!(out["error"]["kind"], "error");
}

#[test]
fn test_parallel_inits_share_one_cache() {
    let ctx = TestContext::with_mirror();
    let shared = ctx.temp_dir.path().join("plugin-cache");
    let manifest = fs::read_to_string(ctx.workdir.join("provman.toml")).unwrap();

    let children: Vec<_> = (0..8)
        .map(|i| {
            let workdir = ctx.temp_dir.path().join(format!("work-{i}"));
            fs::create_dir_all(&workdir).unwrap();
            fs::write(workdir.join("provman.toml"), &manifest).unwrap();
            let child = ctx
                .cmd_in(&workdir)
                .arg("init")
                .arg("--plugin-cache-dir")
                .arg(&shared)
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .spawn()
                .expect("failed to spawn provman");
            (workdir, child)
        })
        .collect();

    let mut locks = Vec::new();
    for (workdir, child) in children {
        let output = child.wait_with_output().unwrap();
        assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
        assert!(package_dir_in(&workdir).join("terraform-provider-null_v3.2.0").exists());
        locks.push(fs::read_to_string(workdir.join("provman.lock")).unwrap());
    }
    locks.dedup();
    assert_eq!(locks.len(), 1);

    let platform = Platform::current().to_string();
    let version_dir = shared.join("registry.opentofu.org/hashicorp/null/3.2.0");
    let mut names: Vec<String> = fs::read_dir(&version_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec![platform.clone(), format!("{platform}.lock")]);
}

#[test]
fn test_missing_requirements_is_config_error() {
    let ctx = TestContext::new();
    let (ok, out) = ctx.run_json(&["init"]);
    assert!(!ok);
    assert_eq!(out["error"]["kind"], "config");
}
