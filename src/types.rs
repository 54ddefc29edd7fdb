//! Core types shared by the listener, its groups and the backend collaborators.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ListenerError, Result};

/// A mailbox identity: the user a subscription is created for.
///
/// Stored lower-cased so that equality is case-insensitive.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity(String);

impl Identity {
    /// Parse and normalise a mailbox address (`local@domain`).
    pub fn parse(address: &str) -> Result<Self> {
        let trimmed = address.trim();
        let invalid = || ListenerError::InvalidIdentity(address.to_string());

        if trimmed.chars().any(char::is_whitespace) {
            return Err(invalid());
        }
        let (local, domain) = trimmed.split_once('@').ok_or_else(invalid)?;
        if local.is_empty() || domain.is_empty() || domain.contains('@') {
            return Err(invalid());
        }
        if domain.starts_with('.') || domain.ends_with('.') {
            return Err(invalid());
        }

        Ok(Identity(trimmed.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part after the `@`.
    pub fn domain(&self) -> &str {
        self.0.split_once('@').map(|(_, d)| d).unwrap_or_default()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Identity {
    type Err = ListenerError;

    fn from_str(s: &str) -> Result<Self> {
        Identity::parse(s)
    }
}

/// Which physical endpoint a subscription must live on.
///
/// Two identities with equal keys share one connection; different keys never do.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointKey {
    /// Backend-assigned affinity identifier.
    pub grouping_key: String,
    /// Address of the endpoint serving the group.
    pub external_url: String,
}

impl EndpointKey {
    pub fn new(grouping_key: impl Into<String>, external_url: impl Into<String>) -> Self {
        Self {
            grouping_key: grouping_key.into(),
            external_url: external_url.into(),
        }
    }
}

impl fmt::Debug for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointKey({};{})", self.grouping_key, self.external_url)
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{}", self.grouping_key, self.external_url)
    }
}

/// Opaque authentication handle, shared read-only by every group.
#[derive(Clone)]
pub struct Credential(Arc<CredentialInner>);

struct CredentialInner {
    principal: String,
    secret: String,
}

impl Credential {
    pub fn new(principal: impl Into<String>, secret: impl Into<String>) -> Self {
        Credential(Arc::new(CredentialInner {
            principal: principal.into(),
            secret: secret.into(),
        }))
    }

    /// The account the credential authenticates as.
    pub fn principal(&self) -> &str {
        &self.0.principal
    }

    pub fn secret(&self) -> &str {
        &self.0.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("principal", &self.0.principal)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Version of the backend protocol spoken by the collaborators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    Exchange2007Sp1,
    Exchange2010,
    Exchange2010Sp1,
    Exchange2010Sp2,
    Exchange2013,
}

impl ProtocolVersion {
    /// Push subscriptions only exist from 2010 SP1 onwards.
    pub fn supports_push(self) -> bool {
        self >= ProtocolVersion::Exchange2010Sp1
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::Exchange2010Sp1
    }
}

/// Folders that can be addressed without knowing their id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WellKnownFolder {
    Inbox,
    SentItems,
    DeletedItems,
    Drafts,
    Calendar,
    Contacts,
    Tasks,
    Notes,
    Outbox,
    JunkEmail,
}

/// A folder under observation. Passed through to the backend untouched.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderRef {
    WellKnown(WellKnownFolder),
    Id(String),
}

impl From<WellKnownFolder> for FolderRef {
    fn from(folder: WellKnownFolder) -> Self {
        FolderRef::WellKnown(folder)
    }
}

impl fmt::Display for FolderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FolderRef::WellKnown(folder) => write!(f, "{:?}", folder),
            FolderRef::Id(id) => f.write_str(id),
        }
    }
}

/// Kinds of events a subscription can ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewMail,
    Created,
    Deleted,
    Modified,
    Moved,
    Copied,
    FreeBusyChanged,
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time. Clocks before the epoch read as zero.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A single event reported by the backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    /// Item the event is about, if any.
    pub item_id: Option<String>,
    /// Folder the item (or folder) lives in after the event.
    pub parent_folder_id: Option<String>,
    /// Previous parent for move/copy events.
    pub old_parent_folder_id: Option<String>,
    pub timestamp: Timestamp,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            item_id: None,
            parent_folder_id: None,
            old_parent_folder_id: None,
            timestamp: Timestamp::now(),
        }
    }

    pub fn with_item(mut self, item_id: impl Into<String>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }

    pub fn in_folder(mut self, folder_id: impl Into<String>) -> Self {
        self.parent_folder_id = Some(folder_id.into());
        self
    }
}

/// Backend-issued subscription handle.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A subscription as created by the backend, before or after it joined a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendSubscription {
    pub id: SubscriptionId,
    /// Watermark the backend hands out with the subscription, if it has one.
    pub watermark: Option<String>,
}

impl BackendSubscription {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: SubscriptionId(id.into()),
            watermark: None,
        }
    }
}
