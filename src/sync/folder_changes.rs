//! Paged folder synchronisation.

use std::sync::Arc;
use tracing::debug;

use super::types::{FolderSyncState, SyncChangesResult, SyncPage, SyncRequest};
use crate::backend::EndpointResolver;
use crate::error::{BackendError, ListenerError, Result};
use crate::types::{Credential, Identity, ProtocolVersion};

/// Changes requested per page.
pub const SYNC_PAGE_SIZE: usize = 512;

/// Fetches pages of item changes for one folder.
pub trait FolderSyncBackend: Send + Sync {
    fn sync_folder_items(&self, request: &SyncRequest<'_>) -> std::result::Result<SyncPage, BackendError>;
}

/// Pulls the changes that happened in users' folders since saved sync states.
pub struct FolderChanges {
    credential: Credential,
    version: ProtocolVersion,
    resolver: Arc<dyn EndpointResolver>,
    backend: Arc<dyn FolderSyncBackend>,
}

impl FolderChanges {
    pub fn new(
        credential: Credential,
        resolver: Arc<dyn EndpointResolver>,
        backend: Arc<dyn FolderSyncBackend>,
    ) -> Self {
        Self {
            credential,
            version: ProtocolVersion::default(),
            resolver,
            backend,
        }
    }

    /// Use `version` for sync requests. Versions a listener would reject are
    /// rejected here too, so both halves talk to the backend alike.
    pub fn with_version(mut self, version: ProtocolVersion) -> Result<Self> {
        if !version.supports_push() {
            return Err(ListenerError::UnsupportedVersion(version));
        }
        self.version = version;
        Ok(self)
    }

    /// All changes for each folder in `states`, in input order.
    ///
    /// Each folder is paged until the backend reports no more changes; the
    /// returned state is the one after the last page.
    pub fn changes_for(
        &self,
        identity: &Identity,
        states: &[FolderSyncState],
    ) -> Result<Vec<SyncChangesResult>> {
        let endpoint = self
            .resolver
            .resolve(identity)
            .map_err(|source| ListenerError::Resolution {
                identity: identity.clone(),
                source,
            })?;

        let mut results = Vec::with_capacity(states.len());
        for state in states {
            let mut changes = Vec::new();
            let mut current = state.sync_state.clone();
            let mut pages = 0usize;

            loop {
                let request = SyncRequest {
                    endpoint: &endpoint,
                    credential: &self.credential,
                    version: self.version,
                    impersonate: identity,
                    folder: &state.folder,
                    sync_state: current.as_deref(),
                    max_changes: SYNC_PAGE_SIZE,
                };
                let page = self
                    .backend
                    .sync_folder_items(&request)
                    .map_err(|source| ListenerError::Sync {
                        folder: state.folder.clone(),
                        source,
                    })?;

                pages += 1;
                changes.extend(page.changes);
                if page.sync_state.is_some() {
                    current = page.sync_state;
                }
                if !page.more_changes_available {
                    break;
                }
            }

            debug!(%identity, folder = %state.folder, pages, changes = changes.len(), "folder synchronised");
            results.push(SyncChangesResult {
                state: FolderSyncState::new(current, state.folder.clone()),
                changes,
            });
        }

        Ok(results)
    }
}
