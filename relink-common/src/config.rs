//! Configuration loading and root folder resolution

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Root folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file value
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(
    cli_arg: Option<&str>,
    env_var_name: &str,
    config_file_value: Option<&str>,
) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    // Priority 3: TOML config file
    if let Some(path) = config_file_value {
        return PathBuf::from(path);
    }

    // Priority 4: OS-dependent compiled default
    default_root_folder()
}

/// Get OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/relink (or /var/lib/relink for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("relink"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/relink"))
    } else if cfg!(target_os = "macos") {
        // ~/Library/Application Support/relink
        dirs::data_dir()
            .map(|d| d.join("relink"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/relink"))
    } else if cfg!(target_os = "windows") {
        // %LOCALAPPDATA%\relink
        dirs::data_local_dir()
            .map(|d| d.join("relink"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\relink"))
    } else {
        PathBuf::from("./relink_data")
    }
}

/// Candidate config file locations for a module, in priority order
///
/// User config (`~/.config/relink/<module>.toml`) wins over the system-wide
/// file (`/etc/relink/<module>.toml` on Unix).
pub fn config_file_candidates(module: &str) -> Vec<PathBuf> {
    let file_name = format!("{}.toml", module);
    let mut candidates = Vec::new();

    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join("relink").join(&file_name));
    }
    if cfg!(unix) {
        candidates.push(PathBuf::from("/etc/relink").join(&file_name));
    }

    candidates
}

/// Find the first existing config file for a module
pub fn find_config_file(module: &str) -> Option<PathBuf> {
    config_file_candidates(module)
        .into_iter()
        .find(|p| p.exists())
}

/// Load and parse a TOML config file into a typed structure
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("read {}: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("parse {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serial_test::serial;
    use std::io::Write;

    #[derive(Debug, Deserialize, PartialEq)]
    struct TestToml {
        root_folder: Option<String>,
        #[serde(default)]
        listen_port: u16,
    }

    #[test]
    #[serial]
    fn test_cli_arg_wins() {
        std::env::set_var("RELINK_TEST_ROOT_A", "/from/env");
        let resolved =
            resolve_root_folder(Some("/from/cli"), "RELINK_TEST_ROOT_A", Some("/from/toml"));
        assert_eq!(resolved, PathBuf::from("/from/cli"));
        std::env::remove_var("RELINK_TEST_ROOT_A");
    }

    #[test]
    #[serial]
    fn test_env_beats_toml() {
        std::env::set_var("RELINK_TEST_ROOT_B", "/from/env");
        let resolved = resolve_root_folder(None, "RELINK_TEST_ROOT_B", Some("/from/toml"));
        assert_eq!(resolved, PathBuf::from("/from/env"));
        std::env::remove_var("RELINK_TEST_ROOT_B");
    }

    #[test]
    #[serial]
    fn test_toml_beats_default() {
        std::env::remove_var("RELINK_TEST_ROOT_C");
        let resolved = resolve_root_folder(None, "RELINK_TEST_ROOT_C", Some("/from/toml"));
        assert_eq!(resolved, PathBuf::from("/from/toml"));
    }

    #[test]
    #[serial]
    fn test_default_when_nothing_set() {
        std::env::remove_var("RELINK_TEST_ROOT_D");
        let resolved = resolve_root_folder(None, "RELINK_TEST_ROOT_D", None);
        assert_eq!(resolved, default_root_folder());
    }

    #[test]
    fn test_load_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relink-matcher.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "root_folder = \"/data/relink\"").unwrap();
        writeln!(f, "listen_port = 6001").unwrap();

        let parsed: TestToml = load_toml(&path).unwrap();
        assert_eq!(parsed.root_folder.as_deref(), Some("/data/relink"));
        assert_eq!(parsed.listen_port, 6001);
    }

    #[test]
    fn test_load_toml_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result: Result<TestToml> = load_toml(&dir.path().join("absent.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_config_file_candidates_include_module_name() {
        let candidates = config_file_candidates("relink-matcher");
        assert!(!candidates.is_empty());
        for c in candidates {
            assert!(c.to_string_lossy().ends_with("relink-matcher.toml"));
        }
    }
}
