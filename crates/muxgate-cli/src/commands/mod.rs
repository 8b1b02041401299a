pub mod config;
pub mod hello;
pub mod stress;

use std::path::Path;

use muxgate_load::LoadConfig;

/// Load `path`, or the defaults when no file was given.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<LoadConfig> {
    match path {
        Some(path) => LoadConfig::from_file(path),
        None => Ok(LoadConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_uses_defaults() {
        assert_eq!(load_config(None).unwrap(), LoadConfig::default());
    }

    #[test]
    fn reads_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("muxgate.toml");
        std::fs::write(&path, "[load]\nworkers = 3\nrequests = 9\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.load.workers, 3);
        assert_eq!(config.load.requests, 9);
    }

    #[test]
    fn unreadable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
