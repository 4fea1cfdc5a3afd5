//! Observable connection and sync state.
//!
//! Three independent facets, each in its own watch channel so a value is
//! always replaced whole. Only the orchestrators hold the writer; everything
//! else gets a read-only `SyncStateView`.

use tokio::sync::watch;

/// Where the currently displayed snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataSource {
    #[default]
    Unknown,
    Peer,
    DirectFetch,
}

/// Point-in-time copy of all three facets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncStatus {
    pub peer_connected: bool,
    pub syncing: bool,
    pub data_source: DataSource,
}

/// Writer side of the sync state.
#[derive(Debug)]
pub struct SyncStateTracker {
    peer_connected: watch::Sender<bool>,
    syncing: watch::Sender<bool>,
    data_source: watch::Sender<DataSource>,
}

impl Default for SyncStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStateTracker {
    pub fn new() -> Self {
        Self {
            peer_connected: watch::Sender::new(false),
            syncing: watch::Sender::new(false),
            data_source: watch::Sender::new(DataSource::Unknown),
        }
    }

    pub fn view(&self) -> SyncStateView {
        SyncStateView {
            peer_connected: self.peer_connected.subscribe(),
            syncing: self.syncing.subscribe(),
            data_source: self.data_source.subscribe(),
        }
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            peer_connected: *self.peer_connected.borrow(),
            syncing: *self.syncing.borrow(),
            data_source: *self.data_source.borrow(),
        }
    }

    pub(crate) fn set_peer_connected(&self, connected: bool) {
        if replace_if_changed(&self.peer_connected, connected) {
            tracing::info!("Peer connected: {}", connected);
        }
    }

    pub(crate) fn set_syncing(&self, syncing: bool) {
        if replace_if_changed(&self.syncing, syncing) {
            tracing::debug!("Syncing: {}", syncing);
        }
    }

    /// Clear `syncing` if it is set. Returns whether this call cleared it,
    /// so two racing callers never both act on the same sync.
    pub(crate) fn take_syncing(&self) -> bool {
        self.syncing.send_if_modified(|syncing| std::mem::replace(syncing, false))
    }

    pub(crate) fn set_data_source(&self, source: DataSource) {
        if replace_if_changed(&self.data_source, source) {
            tracing::info!("Data source: {:?}", source);
        }
    }
}

/// Replace the value, notifying receivers only when it actually changed.
fn replace_if_changed<T: PartialEq>(sender: &watch::Sender<T>, value: T) -> bool {
    sender.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    })
}

/// Read-only handle on the sync state. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SyncStateView {
    peer_connected: watch::Receiver<bool>,
    syncing: watch::Receiver<bool>,
    data_source: watch::Receiver<DataSource>,
}

impl SyncStateView {
    pub fn peer_connected(&self) -> bool {
        *self.peer_connected.borrow()
    }

    pub fn syncing(&self) -> bool {
        *self.syncing.borrow()
    }

    pub fn data_source(&self) -> DataSource {
        *self.data_source.borrow()
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            peer_connected: self.peer_connected(),
            syncing: self.syncing(),
            data_source: self.data_source(),
        }
    }

    /// `borrow()` on the receiver yields the latest value; `changed()`
    /// resolves on every later change.
    pub fn subscribe_peer_connected(&self) -> watch::Receiver<bool> {
        self.peer_connected.clone()
    }

    pub fn subscribe_syncing(&self) -> watch::Receiver<bool> {
        self.syncing.clone()
    }

    pub fn subscribe_data_source(&self) -> watch::Receiver<DataSource> {
        self.data_source.clone()
    }
}
