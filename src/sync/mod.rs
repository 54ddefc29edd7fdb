//! Folder change synchronisation.
//!
//! Complements push notifications: given the sync state saved after the last
//! run, [`FolderChanges`] pulls every item change that happened in a user's
//! folders since then, e.g. to catch up after the listener was down.

mod folder_changes;
mod types;

pub use folder_changes::{FolderChanges, FolderSyncBackend, SYNC_PAGE_SIZE};
pub use types::{ChangeKind, FolderSyncState, ItemChange, SyncChangesResult, SyncPage, SyncRequest};
