use dirs::home_dir;
use std::path::{Path, PathBuf};

/// Lock file name, relative to the working directory.
pub const LOCK_FILE_NAME: &str = "provman.lock";

/// Requirements file name, relative to the working directory.
pub const REQUIREMENTS_FILE_NAME: &str = "provman.toml";

/// Working-directory package cache, relative to the working directory.
pub const LOCAL_CACHE_DIR: &str = ".provman/providers";

/// Returns the per-user configuration directory, or None if the user's home cannot be resolved.
pub fn try_provman_home() -> Option<PathBuf> {
    if let Ok(val) = std::env::var("PROVMAN_HOME") {
        return Some(PathBuf::from(val));
    }
    home_dir().map(|h| h.join(".provman"))
}

/// CLI configuration file: `$PROVMAN_CONFIG_FILE`, else `~/.provman/config.toml`.
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(val) = std::env::var("PROVMAN_CONFIG_FILE") {
        return Some(PathBuf::from(val));
    }
    try_provman_home().map(|h| h.join("config.toml"))
}

/// Lock file for a working directory.
pub fn lock_file_path(workdir: &Path) -> PathBuf {
    workdir.join(LOCK_FILE_NAME)
}

/// Requirements file for a working directory.
pub fn requirements_path(workdir: &Path) -> PathBuf {
    workdir.join(REQUIREMENTS_FILE_NAME)
}

/// Package cache for a working directory.
pub fn local_cache_dir(workdir: &Path) -> PathBuf {
    workdir.join(LOCAL_CACHE_DIR)
}

/// Extract the filename from a URL.
pub fn filename_from_url(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.split('/').next_back().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workdir_layout() {
        let wd = Path::new("/work");
        assert_eq!(lock_file_path(wd), PathBuf::from("/work/provman.lock"));
        assert_eq!(requirements_path(wd), PathBuf::from("/work/provman.toml"));
        assert_eq!(local_cache_dir(wd), PathBuf::from("/work/.provman/providers"));
    }

    #[test]
    fn filename_ignores_query() {
        assert_eq!(
            filename_from_url("https://example.com/dl/terraform-provider-null_3.2.0_linux_amd64.zip?sig=1"),
            "terraform-provider-null_3.2.0_linux_amd64.zip"
        );
        assert_eq!(filename_from_url("https://example.com/"), "");
    }
}
