//! Socket, PID and data file path resolution.
//!
//! Priority for the socket directory:
//! 1. `TABMUX_SOCKET_DIR` (explicit override)
//! 2. `XDG_RUNTIME_DIR/tabmux` (Linux standard)
//! 3. `~/.tabmux` (home directory fallback)
//! 4. `/tmp/tabmux` (last resort)
//!
//! Priority for the data directory (persisted layouts):
//! 1. `TABMUX_DATA_DIR`
//! 2. the platform data dir (`~/.local/share/tabmux` on Linux)
//! 3. `~/.tabmux/data`
//! 4. `/tmp/tabmux-data`

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const SOCKET_FILE: &str = "tabmux.sock";
const PID_FILE: &str = "tabmux.pid";

/// Read an env var, treating an empty value as unset.
fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

/// Get socket directory with priority fallback.
pub fn get_socket_dir() -> PathBuf {
    if let Some(dir) = non_empty_var("TABMUX_SOCKET_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(runtime_dir) = non_empty_var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("tabmux");
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".tabmux");
    }

    env::temp_dir().join("tabmux")
}

/// Get data directory with priority fallback.
pub fn get_data_dir() -> PathBuf {
    if let Some(dir) = non_empty_var("TABMUX_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(data) = dirs::data_dir() {
        return data.join("tabmux");
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".tabmux").join("data");
    }

    env::temp_dir().join("tabmux-data")
}

/// Path of the daemon socket.
pub fn get_socket_path() -> PathBuf {
    get_socket_dir().join(SOCKET_FILE)
}

/// Path of the daemon PID file.
pub fn get_pid_path() -> PathBuf {
    get_socket_dir().join(PID_FILE)
}

/// Directory holding one JSON file per session layout.
pub fn layouts_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("layouts")
}

/// Whether `name` can be used as a single file name component.
///
/// Identifiers arrive from clients, so names must be non-empty, must not
/// start with a hyphen, and may only contain alphanumerics, hyphens and
/// underscores.
pub(crate) fn is_safe_file_stem(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Create `dir` (and parents) with owner-only permissions on Unix.
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", dir.display()))?;
    }

    Ok(())
}

/// Ensure socket directory exists with secure permissions (0700 on Unix).
pub fn ensure_socket_dir() -> Result<()> {
    ensure_private_dir(&get_socket_dir())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    // Env var manipulation is not thread-safe, so tests touching it run
    // serially through this mutex.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Saves env vars and restores them on drop, holding the env mutex.
    pub(crate) struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
        _lock: std::sync::MutexGuard<'static, ()>,
    }

    impl EnvGuard {
        pub(crate) fn new(var_names: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), std::env::var(name).ok()))
                .collect();
            Self { vars, _lock: lock }
        }

        pub(crate) fn set(&self, name: &str, value: &str) {
            // SAFETY: We hold ENV_MUTEX, so no other test thread is modifying env vars
            unsafe { std::env::set_var(name, value) };
        }

        pub(crate) fn remove(&self, name: &str) {
            // SAFETY: We hold ENV_MUTEX, so no other test thread is modifying env vars
            unsafe { std::env::remove_var(name) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                // SAFETY: We hold ENV_MUTEX, so no other test thread is modifying env vars
                unsafe {
                    match value {
                        Some(v) => std::env::set_var(name, v),
                        None => std::env::remove_var(name),
                    }
                }
            }
        }
    }

    #[test]
    fn test_socket_dir_explicit_override() {
        let guard = EnvGuard::new(&["TABMUX_SOCKET_DIR", "XDG_RUNTIME_DIR"]);
        guard.set("TABMUX_SOCKET_DIR", "/custom/socket/path");
        guard.remove("XDG_RUNTIME_DIR");

        assert_eq!(get_socket_dir(), PathBuf::from("/custom/socket/path"));
        assert_eq!(
            get_socket_path(),
            PathBuf::from("/custom/socket/path/tabmux.sock")
        );
        assert_eq!(get_pid_path(), PathBuf::from("/custom/socket/path/tabmux.pid"));
    }

    #[test]
    fn test_socket_dir_ignores_empty_override() {
        let guard = EnvGuard::new(&["TABMUX_SOCKET_DIR", "XDG_RUNTIME_DIR"]);
        guard.set("TABMUX_SOCKET_DIR", "");
        guard.set("XDG_RUNTIME_DIR", "/run/user/1000");

        assert_eq!(get_socket_dir(), PathBuf::from("/run/user/1000/tabmux"));
    }

    #[test]
    fn test_socket_dir_home_fallback() {
        let guard = EnvGuard::new(&["TABMUX_SOCKET_DIR", "XDG_RUNTIME_DIR"]);
        guard.remove("TABMUX_SOCKET_DIR");
        guard.remove("XDG_RUNTIME_DIR");

        assert!(get_socket_dir().to_string_lossy().ends_with(".tabmux"));
    }

    #[test]
    fn test_data_dir_override() {
        let guard = EnvGuard::new(&["TABMUX_DATA_DIR"]);
        guard.set("TABMUX_DATA_DIR", "/var/lib/tabmux");

        assert_eq!(get_data_dir(), PathBuf::from("/var/lib/tabmux"));
        assert_eq!(
            layouts_dir(&get_data_dir()),
            PathBuf::from("/var/lib/tabmux/layouts")
        );
    }

    #[test]
    fn test_data_dir_default_is_namespaced() {
        let guard = EnvGuard::new(&["TABMUX_DATA_DIR"]);
        guard.remove("TABMUX_DATA_DIR");

        let dir = get_data_dir();
        assert!(
            dir.to_string_lossy().contains("tabmux"),
            "unexpected data dir {}",
            dir.display()
        );
    }

    #[test]
    fn test_safe_file_stems() {
        assert!(is_safe_file_stem("default"));
        assert!(is_safe_file_stem("6f1c2b1e-9a7d-4c55-8a8e-2f0e4f1b9d3a"));
        assert!(is_safe_file_stem("_private"));
    }

    #[test]
    fn test_unsafe_file_stems() {
        assert!(!is_safe_file_stem(""));
        assert!(!is_safe_file_stem(".."));
        assert!(!is_safe_file_stem("../../../etc/passwd"));
        assert!(!is_safe_file_stem("foo/bar"));
        assert!(!is_safe_file_stem("-rf"));
        assert!(!is_safe_file_stem("a b"));
        assert!(!is_safe_file_stem("session\0evil"));
    }

    #[test]
    fn test_ensure_private_dir() {
        let dir = std::env::temp_dir()
            .join(format!("tabmux-paths-test-{}", uuid::Uuid::new_v4()))
            .join("nested");
        ensure_private_dir(&dir).unwrap();
        assert!(dir.is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }

        let _ = std::fs::remove_dir_all(dir.parent().unwrap());
    }
}
