//! Work item identifiers.
//!
//! Identifiers end up in git branch names (`foreman/<id>`), workspace
//! directory names, and subprocess arguments, so every externally supplied
//! id is validated before it enters the graph.
//!
//! Generated ids have the shape `<project-slug>-<8 hex>`, e.g. `infra-3f9a01c2`.

use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest accepted identifier.
pub const MAX_ID_LEN: usize = 100;

/// Longest project slug used as an id prefix.
const MAX_PREFIX_LEN: usize = 24;

/// Prefix used while an item has no project yet.
const INBOX_PREFIX: &str = "inbox";

/// Names git treats specially; never valid as item ids.
const RESERVED: &[&str] = &[
    "head",
    "fetch_head",
    "orig_head",
    "merge_head",
    "cherry_pick_head",
    "revert_head",
    "stash",
    "main",
    "master",
    "develop",
    "origin",
];

/// Reason an identifier was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid item id {shown}: {reason}")]
pub struct InvalidItemId {
    shown: String,
    /// Why validation failed.
    pub reason: &'static str,
}

impl InvalidItemId {
    fn new(raw: &str, reason: &'static str) -> Self {
        // Truncated so hostile input cannot flood logs.
        let shown: String = raw.chars().take(50).collect();
        Self {
            shown: format!("{shown:?}"),
            reason,
        }
    }
}

/// Opaque, immutable work item identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemId(String);

impl ItemId {
    /// Validate and wrap a caller-supplied identifier.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidItemId`] when the id is empty, too long, contains
    /// characters outside `[a-z0-9_-]`, does not start and end with an
    /// alphanumeric, or collides with a reserved git ref name.
    pub fn parse(raw: &str) -> Result<Self, InvalidItemId> {
        if raw.is_empty() {
            return Err(InvalidItemId::new(raw, "id is empty"));
        }
        if raw.len() > MAX_ID_LEN {
            return Err(InvalidItemId::new(raw, "id is longer than 100 characters"));
        }
        if !raw
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
        {
            return Err(InvalidItemId::new(
                raw,
                "only lowercase letters, digits, '-' and '_' are allowed",
            ));
        }
        let first = raw.as_bytes()[0];
        let last = raw.as_bytes()[raw.len() - 1];
        if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
            return Err(InvalidItemId::new(
                raw,
                "id must start and end with a letter or digit",
            ));
        }
        if RESERVED.contains(&raw) {
            return Err(InvalidItemId::new(raw, "id collides with a reserved git ref"));
        }
        Ok(Self(raw.to_string()))
    }

    /// Wrap an identifier without validation. Test and fixture use only.
    #[must_use]
    pub fn new_unchecked(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Generate a fresh identifier for an item in `project`.
    ///
    /// The suffix is the first 8 hex chars of a BLAKE3 digest over the
    /// project, title, creation time, and a process-wide counter, so two
    /// items created in the same microsecond still differ.
    #[must_use]
    pub fn generate(project: &str, title: &str, at: DateTime<Utc>) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);

        let mut hasher = blake3::Hasher::new();
        hasher.update(project.as_bytes());
        hasher.update(&[0]);
        hasher.update(title.as_bytes());
        hasher.update(&[0]);
        hasher.update(&at.timestamp_micros().to_le_bytes());
        hasher.update(&seq.to_le_bytes());
        let digest = hasher.finalize().to_hex();

        Self(format!("{}-{}", slug(project), &digest.as_str()[..8]))
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn slug(project: &str) -> String {
    let mut out = String::with_capacity(project.len());
    let mut last_dash = true;
    for ch in project.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
        if out.len() >= MAX_PREFIX_LEN {
            break;
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        INBOX_PREFIX.to_string()
    } else {
        trimmed.to_string()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ItemId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ItemId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ItemId {
    type Error = InvalidItemId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ItemId> for String {
    fn from(value: ItemId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_shapes() {
        for raw in ["aops-5056bc83", "20260119-my-task", "my_task", "a", "x9"] {
            assert!(ItemId::parse(raw).is_ok(), "{raw} should be valid");
        }
    }

    #[test]
    fn rejects_traversal_and_ref_injection() {
        for raw in [
            "",
            "../etc/passwd",
            "a/b",
            "HEAD",
            "head",
            "main",
            "task@{1}",
            "has space",
            "-leading",
            "trailing-",
            "Upper",
        ] {
            assert!(ItemId::parse(raw).is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn rejects_overlong_ids() {
        let raw = "a".repeat(MAX_ID_LEN + 1);
        let err = ItemId::parse(&raw).unwrap_err();
        assert!(err.reason.contains("100"));
        assert!(err.to_string().len() < 200, "message must be truncated");
    }

    #[test]
    fn generated_ids_are_valid_and_distinct() {
        let now = Utc::now();
        let a = ItemId::generate("Infra Tools", "Fix it", now);
        let b = ItemId::generate("Infra Tools", "Fix it", now);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("infra-tools-"));
        assert_eq!(ItemId::parse(a.as_str()).unwrap(), a);
    }

    #[test]
    fn generated_ids_without_project_use_inbox_prefix() {
        let id = ItemId::generate("  ", "Capture", Utc::now());
        assert!(id.as_str().starts_with("inbox-"));
    }

    #[test]
    fn serde_validates_on_deserialize() {
        let ok: ItemId = serde_json::from_str("\"core-1\"").unwrap();
        assert_eq!(ok.as_str(), "core-1");
        assert!(serde_json::from_str::<ItemId>("\"../x\"").is_err());
    }
}
