use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::Data;
use crate::configuration::ConfigurationHandle;
use crate::store::DocumentStore;
use crate::watcher::FilesChanged;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    settings: Data,
    store: DocumentStore,
    configuration: ConfigurationHandle,
    events: broadcast::Sender<FilesChanged>,
}

impl AppState {
    pub fn new(
        settings: Data,
        store: DocumentStore,
        configuration: ConfigurationHandle,
        events: broadcast::Sender<FilesChanged>,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                settings,
                store,
                configuration,
                events,
            }),
        }
    }

    pub fn settings(&self) -> &Data {
        &self.inner.settings
    }

    pub fn store(&self) -> &DocumentStore {
        &self.inner.store
    }

    pub fn configuration(&self) -> &ConfigurationHandle {
        &self.inner.configuration
    }

    pub fn events(&self) -> broadcast::Receiver<FilesChanged> {
        self.inner.events.subscribe()
    }
}
