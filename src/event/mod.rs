use serde_json::Value;
use std::path::{Component, Path};
use thiserror::Error;

/// Dotted path lookups into the event payload.
pub mod path;

use path::lookup_str;

const DEFAULT_BRANCH: &str = "master";

/// A custom error describing the error cases of reading a webhook event.
#[derive(Debug, Error)]
pub enum EventError {
    /// The body is not valid JSON.
    #[error("event body is not valid JSON: {0}")]
    InvalidBody(#[from] serde_json::Error),
    /// A field that is required to act on the event is missing.
    #[error("bad event payload, missing {0}")]
    MissingField(&'static str),
    /// The repository name cannot be used as a cache path.
    #[error("bad event payload, invalid repository name {0:?}")]
    InvalidRepositoryName(String),
}

/// Read-only view of one inbound webhook.
///
/// The payload is always decoded from `raw_body`, so the signature can be checked
/// against exactly the bytes that were received.
#[derive(Debug, Clone)]
pub struct EventView {
    event_type: String,
    raw_body: Vec<u8>,
    payload: Value,
    signature: Option<String>,
}

/// The repository coordinates needed to prepare a working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryTarget {
    pub full_name: String,
    pub clone_url: String,
    pub default_branch: String,
    pub reference: Option<String>,
    pub commit: Option<String>,
}

impl EventView {
    /// Decode the raw body and build the view.
    pub fn parse(
        event_type: impl Into<String>,
        raw_body: Vec<u8>,
        signature: Option<String>,
    ) -> Result<Self, EventError> {
        let payload = serde_json::from_slice(&raw_body)?;

        Ok(EventView {
            event_type: event_type.into(),
            raw_body,
            payload,
            signature,
        })
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn raw_body(&self) -> &[u8] {
        &self.raw_body
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    /// The `owner/name` of the repository that sent the event.
    pub fn full_name(&self) -> Option<&str> {
        lookup_str(&self.payload, "repository.full_name")
    }

    /// Read a string field from the payload.
    pub fn field(&self, path: &str) -> Option<&str> {
        lookup_str(&self.payload, path)
    }

    /// Collect the repository, ref and commit the event points to.
    ///
    /// An all-zero `after` (a deleted ref) counts as no commit.
    pub fn repository_target(&self) -> Result<RepositoryTarget, EventError> {
        let full_name = self
            .full_name()
            .ok_or(EventError::MissingField("repository.full_name"))?;
        validate_full_name(full_name)?;
        let clone_url = self
            .field("repository.clone_url")
            .ok_or(EventError::MissingField("repository.clone_url"))?;
        let default_branch = self
            .field("repository.default_branch")
            .unwrap_or(DEFAULT_BRANCH);

        let reference = self
            .field("ref")
            .filter(|reference| !reference.is_empty())
            .map(String::from);
        let commit = self
            .field("after")
            .filter(|commit| !commit.is_empty() && !commit.bytes().all(|b| b == b'0'))
            .map(String::from);

        Ok(RepositoryTarget {
            full_name: full_name.to_string(),
            clone_url: clone_url.to_string(),
            default_branch: default_branch.to_string(),
            reference,
            commit,
        })
    }
}

fn validate_full_name(full_name: &str) -> Result<(), EventError> {
    let path = Path::new(full_name);
    let is_safe = !full_name.is_empty()
        && !full_name.contains('\\')
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));

    if is_safe {
        Ok(())
    } else {
        Err(EventError::InvalidRepositoryName(full_name.to_string()))
    }
}
