//! Package unpacking.
//!
//! Provider packages are zip archives. Unpacked packages (filesystem mirrors,
//! vendored directories, other caches) are copied file by file.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;
use zip::ZipArchive;
use zip::result::ZipError;

use crate::error::Error;

#[derive(Error, Debug)]
pub enum UnpackError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{}: not a valid package archive: {source}", archive.display())]
    Archive { archive: PathBuf, source: ZipError },
}

impl From<UnpackError> for Error {
    fn from(e: UnpackError) -> Self {
        match e {
            UnpackError::Io(e) => Error::Io(e),
            UnpackError::Archive { archive, source } => Error::Malformed {
                location: archive.display().to_string(),
                detail: source.to_string(),
            },
        }
    }
}

/// Unpack a package archive into `dest`, returning how many files it held.
///
/// Entry names that would land outside `dest` are skipped. Unix permission
/// bits stored in the archive are applied, so provider executables stay
/// executable.
pub fn unpack_zip(archive: &Path, dest: &Path) -> Result<usize, UnpackError> {
    let bad = |source| UnpackError::Archive {
        archive: archive.to_path_buf(),
        source,
    };
    let mut zip = ZipArchive::new(File::open(archive)?).map_err(bad)?;
    fs::create_dir_all(dest)?;

    let mut files = 0;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).map_err(bad)?;
        let Some(name) = entry.enclosed_name() else {
            continue;
        };
        let target = dest.join(name);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        io::copy(&mut entry, &mut File::create(&target)?)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))?;
        }
        files += 1;
    }
    Ok(files)
}

/// Copy the regular files and directories under `src` into `dest`,
/// preserving permissions. Symlinks are followed.
pub fn copy_dir(src: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in WalkDir::new(src).follow_links(true).min_depth(1) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
