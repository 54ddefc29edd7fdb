//! Types for pulling folder item changes.

use crate::types::{Credential, EndpointKey, FolderRef, Identity, ProtocolVersion};
use serde::{Deserialize, Serialize};

/// Where a folder was last synchronised to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderSyncState {
    /// Opaque backend token. `None` means from the very beginning.
    pub sync_state: Option<String>,
    pub folder: FolderRef,
}

impl FolderSyncState {
    pub fn new(sync_state: Option<String>, folder: FolderRef) -> Self {
        Self { sync_state, folder }
    }

    /// Start from the earliest point the backend knows.
    pub fn initial(folder: FolderRef) -> Self {
        Self {
            sync_state: None,
            folder,
        }
    }
}

/// What happened to an item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
    ReadFlagChange,
}

/// One changed item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemChange {
    pub kind: ChangeKind,
    pub item_id: String,
}

impl ItemChange {
    pub fn new(kind: ChangeKind, item_id: impl Into<String>) -> Self {
        Self {
            kind,
            item_id: item_id.into(),
        }
    }
}

/// All changes of one folder since the state passed in, and the state to
/// resume from next time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncChangesResult {
    pub state: FolderSyncState,
    pub changes: Vec<ItemChange>,
}

impl SyncChangesResult {
    pub fn folder(&self) -> &FolderRef {
        &self.state.folder
    }

    /// Save this for the next sync.
    pub fn current_sync_state(&self) -> Option<&str> {
        self.state.sync_state.as_deref()
    }
}

/// One page request.
#[derive(Clone, Debug)]
pub struct SyncRequest<'a> {
    pub endpoint: &'a EndpointKey,
    pub credential: &'a Credential,
    pub version: ProtocolVersion,
    pub impersonate: &'a Identity,
    pub folder: &'a FolderRef,
    pub sync_state: Option<&'a str>,
    pub max_changes: usize,
}

/// One page of changes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncPage {
    pub changes: Vec<ItemChange>,
    /// State after this page.
    pub sync_state: Option<String>,
    pub more_changes_available: bool,
}
