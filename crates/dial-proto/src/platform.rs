use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

const APP_DIR: &str = "dial-radio";

/// Global flag to control whether to use system-installed binaries from PATH
/// instead of bundled ones beside the executable.
static USE_SYSTEM_DEPS: AtomicBool = AtomicBool::new(false);

/// Set whether to use system dependencies (from PATH) instead of bundled ones.
pub fn set_use_system_deps(use_system: bool) {
    USE_SYSTEM_DEPS.store(use_system, Ordering::Relaxed);
}

/// Check whether to use system dependencies from PATH.
pub fn should_use_system_deps() -> bool {
    USE_SYSTEM_DEPS.load(Ordering::Relaxed)
}

/// IPC socket for the mpv player with id `player_id`.  The process id keeps
/// two daemons on one machine from fighting over a socket.
#[cfg(unix)]
pub fn mpv_socket_name(player_id: u64) -> String {
    format!(
        "{}/{}-mpv-{}-{}.sock",
        std::env::temp_dir().display(),
        APP_DIR,
        std::process::id(),
        player_id
    )
}

#[cfg(windows)]
pub fn mpv_socket_name(player_id: u64) -> String {
    format!("{}-mpv-{}-{}", APP_DIR, std::process::id(), player_id)
}

#[cfg(unix)]
pub fn mpv_socket_arg(player_id: u64) -> String {
    format!("--input-ipc-server={}", mpv_socket_name(player_id))
}

#[cfg(windows)]
pub fn mpv_socket_arg(player_id: u64) -> String {
    format!(
        "--input-ipc-server=\\\\.\\pipe\\{}",
        mpv_socket_name(player_id)
    )
}

pub fn data_dir() -> PathBuf {
    // On macOS and Linux, use ~/.local/share/dial-radio/ (XDG standard)
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join(APP_DIR)
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join(APP_DIR)
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

#[cfg(unix)]
fn mpv_binary_names() -> &'static [&'static str] {
    &["mpv"]
}

#[cfg(windows)]
fn mpv_binary_names() -> &'static [&'static str] {
    &["mpv.exe", "mpv"]
}

fn find_beside_exe(names: &[&str]) -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let dir = current_exe.parent()?;
    for name in names {
        let p = dir.join(name);
        if p.exists() {
            return Some(p);
        }
        let p = dir.join("external").join(name);
        if p.exists() {
            return Some(p);
        }
    }
    None
}

fn find_on_path(names: &[&str]) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        for name in names {
            let p = dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }
    None
}

/// Find the mpv binary for playback.
///
/// Searches in order:
/// 1. MPV_PATH environment variable
/// 2. Beside current executable (unless use_system_deps is true)
/// 3. PATH
pub fn find_mpv_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("MPV_PATH") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }

    if !should_use_system_deps() {
        if let Some(p) = find_beside_exe(mpv_binary_names()) {
            return Some(p);
        }
    }

    find_on_path(mpv_binary_names())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_names_are_per_player() {
        assert_ne!(mpv_socket_name(1), mpv_socket_name(2));
        assert!(mpv_socket_arg(7).starts_with("--input-ipc-server="));
    }

    #[test]
    fn test_dirs_are_app_scoped() {
        assert!(data_dir().ends_with(APP_DIR));
        assert!(config_dir().ends_with(APP_DIR));
    }
}
