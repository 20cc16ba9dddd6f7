// SPDX-License-Identifier: CEPL-1.0
//! TOML configuration loading shared by the binaries.

use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::log::Logger;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(path, &text)
}

pub fn parse<T: DeserializeOwned>(path: &Path, text: &str) -> Result<T, ConfigError> {
    toml::from_str(text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Missing file: defaults. Malformed file: warning, then defaults.
pub fn load_or_default<T: DeserializeOwned + Default>(path: &Path, log: &Logger) -> T {
    match load(path) {
        Ok(cfg) => {
            log.info(format_args!("loaded config from {}", path.display()));
            cfg
        }
        Err(ConfigError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            log.debug(format_args!(
                "no config at {}, using defaults",
                path.display()
            ));
            T::default()
        }
        Err(e) => {
            log.warn(format_args!("{e}; using defaults"));
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{CaptureSink, Level};
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct Sample {
        #[serde(default)]
        frames: u32,
        #[serde(default)]
        name: String,
    }

    #[test]
    fn parse_reads_fields() {
        let cfg: Sample = parse(Path::new("inline"), "frames = 3\nname = \"a\"").unwrap();
        assert_eq!(
            cfg,
            Sample {
                frames: 3,
                name: "a".into()
            }
        );
    }

    #[test]
    fn missing_file_falls_back_quietly() {
        let sink = CaptureSink::new();
        let log = Logger::new(sink.clone());
        let cfg: Sample =
            load_or_default(Path::new("/definitely/not/here/cinder.toml"), &log);
        assert_eq!(cfg, Sample::default());
        assert_eq!(sink.count(Level::Warn), 0);
    }

    #[test]
    fn malformed_file_warns_and_falls_back() {
        let path = std::env::temp_dir().join(format!(
            "cinder-config-test-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "frames = \"three\"").unwrap();

        let sink = CaptureSink::new();
        let log = Logger::new(sink.clone());
        let cfg: Sample = load_or_default(&path, &log);
        let _ = std::fs::remove_file(&path);

        assert_eq!(cfg, Sample::default());
        assert_eq!(sink.count(Level::Warn), 1);
    }
}
