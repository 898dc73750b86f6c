//! Container data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::lease::Lease;

use super::new_etag;

/// Maximum container name length.
pub const MAX_CONTAINER_NAME_LENGTH: usize = 63;

/// Public access level for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicAccessLevel {
    Container,
    Blob,
}

impl PublicAccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublicAccessLevel::Container => "container",
            PublicAccessLevel::Blob => "blob",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "container" => Some(PublicAccessLevel::Container),
            "blob" => Some(PublicAccessLevel::Blob),
            _ => None,
        }
    }
}

/// Access policy for a signed identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessPolicy {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
    pub permission: String,
}

/// Signed identifier in a container access policy list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignedIdentifier {
    pub id: String,
    pub access_policy: AccessPolicy,
}

/// Container row stored in the metadata store.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerModel {
    /// Surrogate monotonic id, used as a list cursor. `None` until the row
    /// has been inserted.
    pub container_id: Option<i64>,
    /// Account name.
    pub account: String,
    /// Container name.
    pub name: String,
    pub last_modified: DateTime<Utc>,
    pub etag: String,
    /// User-defined metadata.
    pub metadata: HashMap<String, String>,
    /// Signed identifiers for stored access policies.
    pub acl: Vec<SignedIdentifier>,
    pub public_access: Option<PublicAccessLevel>,
    pub has_immutability_policy: bool,
    pub has_legal_hold: bool,
    /// Embedded lease record.
    pub lease: Lease,
}

impl ContainerModel {
    /// Creates a new container row stamped at `now`.
    pub fn new(account: impl Into<String>, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            container_id: None,
            account: account.into(),
            name: name.into(),
            last_modified: now,
            etag: new_etag(),
            metadata: HashMap::new(),
            acl: Vec::new(),
            public_access: None,
            has_immutability_policy: false,
            has_legal_hold: false,
            lease: Lease::available(),
        }
    }

    /// Installs a fresh etag and advances `last_modified` without ever
    /// moving it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.etag = new_etag();
        self.last_modified = self.last_modified.max(now);
    }
}
