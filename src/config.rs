use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::filesystem::TargetDirectory;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read config file '{filename}': {source}")]
    FileRead {
        filename: String,
        source: std::io::Error,
    },
    #[error("Unable to parse config file '{filename}': {source}")]
    Parse {
        filename: String,
        source: toml::de::Error,
    },
    #[error("Directory '{}' for {name} does not exist", path.display())]
    MissingDirectory { name: String, path: PathBuf },
    #[error("Directory '{}' for {name} is not writable: {source}", path.display())]
    NotWritable {
        name: String,
        path: PathBuf,
        source: std::io::Error,
    },
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_interval_ms() -> u64 {
    2000
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DirectoryConfig {
    pub inbox: PathBuf,
    pub outbox: PathBuf,
    pub archive: PathBuf,
    pub config: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PdfConfig {
    #[serde(default)]
    pub library_path: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatcherConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            interval_ms: default_interval_ms(),
        }
    }
}

// Parent struct holding the entire config file
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Data {
    pub(crate) agent: AgentConfig,
    pub(crate) directories: DirectoryConfig,
    #[serde(default)]
    pub(crate) pdf: PdfConfig,
    #[serde(default)]
    pub(crate) watcher: WatcherConfig,
}

impl Data {
    pub fn root(&self, target: TargetDirectory) -> &Path {
        match target {
            TargetDirectory::Inbox => &self.directories.inbox,
            TargetDirectory::Outbox => &self.directories.outbox,
            TargetDirectory::Archive => &self.directories.archive,
        }
    }

    pub fn configuration_file(&self) -> PathBuf {
        self.directories.config.join("configuration.json")
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.directories.config.join("journal")
    }

    /// Checks every configured directory exists and accepts new files.
    pub fn verify_directories(&self) -> Result<(), ConfigError> {
        let dirs = [
            ("inbox", &self.directories.inbox),
            ("outbox", &self.directories.outbox),
            ("archive", &self.directories.archive),
            ("config", &self.directories.config),
        ];

        for (name, path) in dirs {
            verify_writable(name, path)?;
            tracing::info!("{} directory: {}", name, path.display());
        }

        Ok(())
    }
}

fn verify_writable(name: &str, path: &Path) -> Result<(), ConfigError> {
    if !path.is_dir() {
        return Err(ConfigError::MissingDirectory {
            name: name.to_string(),
            path: path.to_path_buf(),
        });
    }

    let scratch = path.join(format!(".pdfdesk-write-check-{}", uuid::Uuid::new_v4()));
    fs::write(&scratch, b"")
        .and_then(|_| fs::remove_file(&scratch))
        .map_err(|source| ConfigError::NotWritable {
            name: name.to_string(),
            path: path.to_path_buf(),
            source,
        })
}

pub fn load_config(filename: &str) -> Result<Data, ConfigError> {
    let contents = fs::read_to_string(filename).map_err(|source| ConfigError::FileRead {
        filename: filename.to_string(),
        source,
    })?;

    let data: Data = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        filename: filename.to_string(),
        source,
    })?;

    Ok(data)
}

#[cfg(test)]
pub(crate) fn test_data(base: &Path) -> Data {
    let directories = DirectoryConfig {
        inbox: base.join("inbox"),
        outbox: base.join("outbox"),
        archive: base.join("archive"),
        config: base.join("config"),
    };
    for dir in [
        &directories.inbox,
        &directories.outbox,
        &directories.archive,
        &directories.config,
    ] {
        fs::create_dir_all(dir).unwrap();
    }

    Data {
        agent: AgentConfig {
            name: "test".to_string(),
            host: default_host(),
            port: 0,
            static_dir: None,
        },
        directories,
        pdf: PdfConfig::default(),
        watcher: WatcherConfig { interval_ms: 50 },
    }
}
