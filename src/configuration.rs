//! The UI feature flag file (`configuration.json`).
//!
//! The file is created with defaults when it is missing. Readers take a
//! snapshot with [`ConfigurationHandle::current`] or follow changes through
//! [`ConfigurationHandle::subscribe`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("could not access configuration file '{}': {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("configuration file '{}' is invalid: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HeaderConfiguration {
    pub show_title: bool,
    pub title: String,
    pub show_theme_toggle: bool,
    pub show_language_select: bool,
}

impl Default for HeaderConfiguration {
    fn default() -> Self {
        HeaderConfiguration {
            show_title: true,
            title: "pdfdesk".to_string(),
            show_theme_toggle: true,
            show_language_select: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GeneralConfiguration {
    /// Archiving deletes the document instead of moving it.
    pub delete_on_archive: bool,
    /// Saving an edited document archives its original instead of deleting it.
    pub archive_original_on_save: bool,
    pub confirm_delete: bool,
    pub language: String,
    pub theme: String,
}

impl Default for GeneralConfiguration {
    fn default() -> Self {
        GeneralConfiguration {
            delete_on_archive: false,
            archive_original_on_save: false,
            confirm_delete: true,
            language: "en".to_string(),
            theme: "system".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PreviewConfiguration {
    pub width: u32,
    pub height: u32,
    pub show_page_numbers: bool,
}

impl Default for PreviewConfiguration {
    fn default() -> Self {
        // A4 at 72 dpi
        PreviewConfiguration {
            width: 595,
            height: 842,
            show_page_numbers: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct InboxConfiguration {
    pub show_upload: bool,
    pub show_rotate: bool,
    pub show_delete_pages: bool,
    pub show_reorder: bool,
    pub show_split: bool,
    pub show_merge: bool,
    pub show_unlock: bool,
}

impl Default for InboxConfiguration {
    fn default() -> Self {
        InboxConfiguration {
            show_upload: true,
            show_rotate: true,
            show_delete_pages: true,
            show_reorder: true,
            show_split: true,
            show_merge: true,
            show_unlock: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OutboxConfiguration {
    pub show_tree: bool,
    pub allow_save_to: bool,
}

impl Default for OutboxConfiguration {
    fn default() -> Self {
        OutboxConfiguration {
            show_tree: true,
            allow_save_to: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ArchiveConfiguration {
    pub show_restore: bool,
    pub show_permanent_delete: bool,
}

impl Default for ArchiveConfiguration {
    fn default() -> Self {
        ArchiveConfiguration {
            show_restore: true,
            show_permanent_delete: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FooterConfiguration {
    pub show_version: bool,
    pub text: String,
}

impl Default for FooterConfiguration {
    fn default() -> Self {
        FooterConfiguration {
            show_version: true,
            text: String::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Configuration {
    pub header: HeaderConfiguration,
    pub general: GeneralConfiguration,
    pub preview: PreviewConfiguration,
    pub inbox: InboxConfiguration,
    pub outbox: OutboxConfiguration,
    pub archive: ArchiveConfiguration,
    pub footer: FooterConfiguration,
}

fn read(path: &Path) -> Result<Configuration, ConfigurationError> {
    let bytes = fs::read(path).map_err(|source| ConfigurationError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ConfigurationError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn write(path: &Path, configuration: &Configuration) -> Result<(), ConfigurationError> {
    let io_error = |source| ConfigurationError::Io {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_vec_pretty(configuration).map_err(|source| {
        ConfigurationError::Parse {
            path: path.to_path_buf(),
            source,
        }
    })?;

    let temp = path.with_extension("json.tmp");
    fs::write(&temp, json).map_err(io_error)?;
    fs::rename(&temp, path).map_err(io_error)
}

/// Shared access to the current configuration.
#[derive(Clone)]
pub struct ConfigurationHandle {
    path: PathBuf,
    sender: Arc<watch::Sender<Configuration>>,
}

impl ConfigurationHandle {
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigurationError> {
        let configuration = if path.exists() {
            read(path)?
        } else {
            tracing::info!("creating default configuration at {}", path.display());
            let defaults = Configuration::default();
            write(path, &defaults)?;
            defaults
        };

        let (sender, _) = watch::channel(configuration);
        Ok(ConfigurationHandle {
            path: path.to_path_buf(),
            sender: Arc::new(sender),
        })
    }

    pub fn current(&self) -> Configuration {
        self.sender.borrow().clone()
    }

    /// Persists `configuration` and publishes it to subscribers.
    pub fn update(&self, configuration: Configuration) -> Result<(), ConfigurationError> {
        write(&self.path, &configuration)?;
        self.sender.send_replace(configuration);
        tracing::info!("configuration saved");
        Ok(())
    }

    /// Re-reads the file, picking up edits made outside the service.
    pub fn reload(&self) -> Result<Configuration, ConfigurationError> {
        let configuration = read(&self.path)?;
        self.sender.send_replace(configuration.clone());
        tracing::info!("configuration reloaded from {}", self.path.display());
        Ok(configuration)
    }

    pub fn subscribe(&self) -> watch::Receiver<Configuration> {
        self.sender.subscribe()
    }
}

fn changed_sections(before: &Configuration, after: &Configuration) -> Vec<&'static str> {
    let mut sections = Vec::new();
    if before.header != after.header {
        sections.push("header");
    }
    if before.general != after.general {
        sections.push("general");
    }
    if before.preview != after.preview {
        sections.push("preview");
    }
    if before.inbox != after.inbox {
        sections.push("inbox");
    }
    if before.outbox != after.outbox {
        sections.push("outbox");
    }
    if before.archive != after.archive {
        sections.push("archive");
    }
    if before.footer != after.footer {
        sections.push("footer");
    }
    sections
}

/// Logs each published configuration until `shutdown` flips to true or the
/// handle is gone. Returns the number of changes seen.
pub async fn log_changes(
    mut changes: watch::Receiver<Configuration>,
    mut shutdown: watch::Receiver<bool>,
) -> usize {
    let mut previous = changes.borrow().clone();
    let mut seen = 0;

    loop {
        tokio::select! {
            biased;
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = changes.borrow_and_update().clone();
                let sections = changed_sections(&previous, &current);
                if sections.is_empty() {
                    tracing::debug!("configuration republished without changes");
                } else {
                    tracing::info!("configuration sections changed: {}", sections.join(", "));
                }
                if current.general.delete_on_archive != previous.general.delete_on_archive {
                    tracing::info!(
                        "archiving now {} documents",
                        if current.general.delete_on_archive { "deletes" } else { "keeps" }
                    );
                }
                previous = current;
                seen += 1;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("configuration.json");

        let handle = ConfigurationHandle::load_or_create(&path).unwrap();

        assert_eq!(handle.current(), Configuration::default());
        let written: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["general"]["deleteOnArchive"], false);
        assert_eq!(written["preview"]["width"], 595);
    }

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("configuration.json");
        fs::write(&path, r#"{"general": {"deleteOnArchive": true}}"#).unwrap();

        let configuration = ConfigurationHandle::load_or_create(&path).unwrap().current();

        assert!(configuration.general.delete_on_archive);
        assert_eq!(configuration.general.language, "en");
        assert_eq!(configuration.header, HeaderConfiguration::default());
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("configuration.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            ConfigurationHandle::load_or_create(&path),
            Err(ConfigurationError::Parse { .. })
        ));
    }

    #[test]
    fn update_persists_and_notifies() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("configuration.json");
        let handle = ConfigurationHandle::load_or_create(&path).unwrap();
        let mut receiver = handle.subscribe();

        let mut changed = handle.current();
        changed.general.archive_original_on_save = true;
        handle.update(changed.clone()).unwrap();

        assert!(receiver.has_changed().unwrap());
        assert_eq!(*receiver.borrow_and_update(), changed);
        assert_eq!(read(&path).unwrap(), changed);
    }

    #[test]
    fn changed_sections_names_only_what_differs() {
        let before = Configuration::default();
        let mut after = before.clone();
        after.footer.text = "new footer".to_string();
        after.general.confirm_delete = !before.general.confirm_delete;

        assert_eq!(changed_sections(&before, &after), ["general", "footer"]);
        assert!(changed_sections(&before, &before).is_empty());
    }

    #[tokio::test]
    async fn log_changes_follows_updates_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("configuration.json");
        let handle = ConfigurationHandle::load_or_create(&path).unwrap();
        let (stop, shutdown) = watch::channel(false);
        let follower = tokio::spawn(log_changes(handle.subscribe(), shutdown));

        let mut changed = handle.current();
        changed.general.delete_on_archive = !changed.general.delete_on_archive;
        handle.update(changed).unwrap();
        stop.send(true).unwrap();

        assert_eq!(follower.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn log_changes_stops_when_the_handle_is_dropped() {
        let dir = TempDir::new().unwrap();
        let handle = ConfigurationHandle::load_or_create(&dir.path().join("c.json")).unwrap();
        let (_stop, shutdown) = watch::channel(false);
        let follower = tokio::spawn(log_changes(handle.subscribe(), shutdown));

        drop(handle);
        assert_eq!(follower.await.unwrap(), 0);
    }

    #[test]
    fn reload_picks_up_external_edits() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("configuration.json");
        let handle = ConfigurationHandle::load_or_create(&path).unwrap();

        fs::write(&path, r#"{"footer": {"text": "edited by hand"}}"#).unwrap();
        let reloaded = handle.reload().unwrap();

        assert_eq!(reloaded.footer.text, "edited by hand");
        assert_eq!(handle.current().footer.text, "edited by hand");
    }
}
