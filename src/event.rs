//! Canonical event shape shared by every producer and sink
//!
//! An event is `(name, datetime, pseudonymized user, ordered attributes)`.
//! Attribute order is significant: it feeds both the content digest used
//! for dedup and the positional columns of the flat-file sink.

use chrono::NaiveDateTime;
use sha2::{Digest, Sha256};

use crate::error::DataError;

/// Timestamp format used for event times, watermark annotations, and
/// sink projections.
pub const EVENT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One canonical event. Transient: produced by a producer, consumed by
/// the dispatcher, never stored as such.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalEvent {
    /// Event type, e.g. "shellcmd" or "compile"
    pub name: String,
    /// When the event happened (from the log record, never "now")
    pub datetime: NaiveDateTime,
    /// Pseudonymized user identifier
    pub user: String,
    /// Ordered (key, value) attribute pairs
    pub attributes: Vec<(String, String)>,
}

impl CanonicalEvent {
    /// Create an event with no attributes yet.
    pub fn new(
        name: impl Into<String>,
        datetime: NaiveDateTime,
        user: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            datetime,
            user: user.into(),
            attributes: Vec::new(),
        }
    }

    /// Append an attribute, keeping emission order.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    /// Check the minimum shape every event must have. A violation is a
    /// producer bug and is fatal upstream.
    pub fn validate(&self) -> Result<(), DataError> {
        if self.name.is_empty() {
            return Err(DataError::IncompleteEvent { field: "name" });
        }
        if self.user.is_empty() {
            return Err(DataError::IncompleteEvent { field: "user" });
        }
        Ok(())
    }

    /// Canonical serialization the content digest is computed over.
    /// Field order is fixed; attribute order is the emission order.
    pub fn canonical_string(&self) -> String {
        let mut out = format!(
            "{}|{}|{}",
            self.name,
            self.datetime.format(EVENT_TIME_FORMAT),
            self.user
        );
        for (key, value) in &self.attributes {
            out.push('|');
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        }
        out
    }

    /// SHA-256 digest of the canonical serialization, hex encoded.
    /// Two byte-identical events always share a digest.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        let event = CanonicalEvent::new("", at(10, 0, 0), "ab12cd34e");
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_user() {
        let event = CanonicalEvent::new("shellcmd", at(10, 0, 0), "");
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_identical_events_share_hash() {
        let a = CanonicalEvent::new("shellcmd", at(10, 0, 0), "ab12cd34e")
            .attr("program", "ls")
            .attr("command", "ls -la");
        let b = CanonicalEvent::new("shellcmd", at(10, 0, 0), "ab12cd34e")
            .attr("program", "ls")
            .attr("command", "ls -la");
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_attribute_order_changes_hash() {
        let a = CanonicalEvent::new("shellcmd", at(10, 0, 0), "ab12cd34e")
            .attr("program", "ls")
            .attr("command", "ls -la");
        let b = CanonicalEvent::new("shellcmd", at(10, 0, 0), "ab12cd34e")
            .attr("command", "ls -la")
            .attr("program", "ls");
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_canonical_string_layout() {
        let event = CanonicalEvent::new("shellcmd", at(9, 30, 1), "ab12cd34e")
            .attr("program", "gcc");
        assert_eq!(
            event.canonical_string(),
            "shellcmd|2024-03-05 09:30:01|ab12cd34e|program=gcc"
        );
    }
}
