//! Service directory layout on the host and inside build containers.

use std::path::PathBuf;

/// Directory mounted into build containers for service scripts and results.
pub const CONTAINER_SERVICE_DIR: &str = "/.werf";

/// Service home directory, `~/.werf` unless overridden via `WERF_HOME`.
pub fn home_dir() -> PathBuf {
    if let Ok(home) = std::env::var("WERF_HOME") {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }
    dirs::home_dir().unwrap_or_else(std::env::temp_dir).join(".werf")
}

/// Host directory shared between builds of all projects (persistent mounts).
pub fn shared_context_dir() -> PathBuf {
    home_dir().join("shared_context")
}

/// Root for per-build temp directories.
pub fn tmp_dir() -> PathBuf {
    home_dir().join("tmp")
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

/// Normalize a container-side path: rooted at `/`, `.`/`..`/empty segments
/// resolved, no trailing slash.
pub fn clean_unix_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Join path segments under a unix base path.
pub fn join_unix_path(base: &str, seg: &str) -> String {
    clean_unix_path(&format!("{}/{}", base, seg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_unix_path() {
        assert_eq!(clean_unix_path("tmp/foo"), "/tmp/foo");
        assert_eq!(clean_unix_path("/tmp//foo/"), "/tmp/foo");
        assert_eq!(clean_unix_path("/tmp/./foo/../bar"), "/tmp/bar");
        assert_eq!(clean_unix_path("/"), "/");
    }

    #[test]
    fn test_join_unix_path() {
        assert_eq!(join_unix_path("/app", "src"), "/app/src");
        assert_eq!(join_unix_path("/app/", "/src"), "/app/src");
        assert_eq!(join_unix_path("/app/src", "**"), "/app/src/**");
    }
}
