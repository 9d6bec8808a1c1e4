//! Incremental change tracking across runs
//!
//! Every run re-scans each source file in full; the tracker remembers,
//! per source identifier, the file modification time last seen plus the
//! textual timestamp of the newest event actually emitted. Producers use
//! the verdict to skip unmodified files entirely, and the stored event
//! time to skip lines already emitted in a prior run. The table is
//! persisted once, at normal process exit; a crash discards the run's
//! updates, which is safe because the dispatcher deduplicates.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::debug;

use crate::error::{ConfigError, DataError, Result};

/// Modification-time slack below which a file counts as unchanged.
const MTIME_TOLERANCE: f64 = 0.005;

/// Persisted per-source record: modification time plus caller-supplied
/// annotations (the first one is the newest emitted event time).
#[derive(Debug, Clone, PartialEq)]
pub struct Watermark {
    pub mtime: f64,
    pub extra: Vec<String>,
}

/// Verdict for one source file.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// No prior record: must be processed, nothing is known about it.
    FirstSeen,
    /// Modified since the stored watermark; the stored tuple is returned
    /// so the caller can resume after the last emitted event.
    Modified(Watermark),
    /// Unchanged within tolerance: skip.
    Unmodified,
}

/// The watermark table. One per process.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    store_path: Option<PathBuf>,
    entries: HashMap<String, Watermark>,
}

impl ChangeTracker {
    /// A tracker with no backing store: every source is reported as
    /// never seen and updates are discarded.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Whether watermarks are being kept at all.
    pub fn is_enabled(&self) -> bool {
        self.store_path.is_some()
    }

    /// Load the persisted table. A missing store is created empty when
    /// `create` is set and is a fatal configuration error otherwise.
    pub fn open(path: &Path, create: bool) -> Result<Self> {
        if !path.exists() {
            if !create {
                return Err(ConfigError::StoreMissing {
                    path: path.display().to_string(),
                }
                .into());
            }
            std::fs::File::create(path)?;
            return Ok(Self {
                store_path: Some(path.to_path_buf()),
                entries: HashMap::new(),
            });
        }

        let text = std::fs::read_to_string(path)?;
        let mut entries = HashMap::new();
        for line in text.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split(',');
            let (identifier, mtime) = match (fields.next(), fields.next()) {
                (Some(id), Some(raw)) => match raw.parse::<f64>() {
                    Ok(mtime) => (id.to_string(), mtime),
                    Err(_) => {
                        return Err(DataError::MalformedStore {
                            file: path.display().to_string(),
                            line: line.to_string(),
                        }
                        .into())
                    }
                },
                _ => {
                    return Err(DataError::MalformedStore {
                        file: path.display().to_string(),
                        line: line.to_string(),
                    }
                    .into())
                }
            };
            let extra: Vec<String> = fields.map(str::to_string).collect();
            entries.insert(identifier, Watermark { mtime, extra });
        }

        Ok(Self {
            store_path: Some(path.to_path_buf()),
            entries,
        })
    }

    /// Compare the file's current on-disk modification time against the
    /// stored watermark for `identifier`.
    pub fn needs_processing(&self, identifier: &str, file: &Path) -> Result<Verdict> {
        if !self.is_enabled() {
            return Ok(Verdict::FirstSeen);
        }
        let Some(stored) = self.entries.get(identifier) else {
            return Ok(Verdict::FirstSeen);
        };
        let mtime = file_mtime(file)?;
        if mtime - stored.mtime <= MTIME_TOLERANCE {
            debug!(identifier, "source unmodified, skipping");
            return Ok(Verdict::Unmodified);
        }
        Ok(Verdict::Modified(stored.clone()))
    }

    /// Record the file's current modification time together with the
    /// caller's annotations; `extra[0]` is expected to carry the newest
    /// event time the caller actually emitted for this source.
    pub fn update(&mut self, identifier: &str, file: &Path, extra: Vec<String>) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let mtime = file_mtime(file)?;
        self.entries
            .insert(identifier.to_string(), Watermark { mtime, extra });
        Ok(())
    }

    /// Serialize the whole table. Called exactly once, at normal exit.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.store_path else {
            return Ok(());
        };
        let mut out = std::fs::File::create(path)?;
        let mut identifiers: Vec<&String> = self.entries.keys().collect();
        identifiers.sort();
        for identifier in identifiers {
            let mark = &self.entries[identifier];
            write!(out, "{identifier},{}", mark.mtime)?;
            for field in &mark.extra {
                write!(out, ",{field}")?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

fn file_mtime(path: &Path) -> std::io::Result<f64> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "payload").unwrap();
        path
    }

    #[test]
    fn test_missing_store_without_create_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = ChangeTracker::open(&dir.path().join("marks.csv"), false);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_store_with_create_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("marks.csv");
        let tracker = ChangeTracker::open(&store, true).unwrap();
        assert!(tracker.is_enabled());
        assert!(store.exists());
    }

    #[test]
    fn test_first_seen_then_unmodified() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("marks.csv");
        let source = touch(dir.path(), "a.log");

        let mut tracker = ChangeTracker::open(&store, true).unwrap();
        let id = "shell_history//a.log";
        assert_eq!(
            tracker.needs_processing(id, &source).unwrap(),
            Verdict::FirstSeen
        );

        tracker
            .update(id, &source, vec!["2024-01-01 00:00:00".to_string()])
            .unwrap();
        assert_eq!(
            tracker.needs_processing(id, &source).unwrap(),
            Verdict::Unmodified
        );
    }

    #[test]
    fn test_mtime_jitter_within_tolerance_skips() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("marks.csv");
        let source = touch(dir.path(), "a.log");
        let mtime = file_mtime(&source).unwrap();

        let mut tracker = ChangeTracker::disabled();
        tracker.store_path = Some(store);
        tracker.entries.insert(
            "r//a".to_string(),
            Watermark {
                // Stored just under the observed mtime, inside tolerance.
                mtime: mtime - 0.001,
                extra: vec!["2024-01-01 00:00:00".to_string()],
            },
        );
        assert_eq!(
            tracker.needs_processing("r//a", &source).unwrap(),
            Verdict::Unmodified
        );
    }

    #[test]
    fn test_modified_returns_stored_tuple() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("marks.csv");
        let source = touch(dir.path(), "a.log");
        let mtime = file_mtime(&source).unwrap();

        let mut tracker = ChangeTracker::disabled();
        tracker.store_path = Some(store);
        let stored = Watermark {
            mtime: mtime - 10.0,
            extra: vec!["2024-01-01 00:00:00".to_string()],
        };
        tracker.entries.insert("r//a".to_string(), stored.clone());
        assert_eq!(
            tracker.needs_processing("r//a", &source).unwrap(),
            Verdict::Modified(stored)
        );
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("marks.csv");
        let source = touch(dir.path(), "a.log");

        let mut tracker = ChangeTracker::open(&store, true).unwrap();
        tracker
            .update(
                "shell_history//a.log",
                &source,
                vec!["2024-03-05 09:30:01".to_string(), "42".to_string()],
            )
            .unwrap();
        tracker.save().unwrap();

        let reloaded = ChangeTracker::open(&store, false).unwrap();
        let mark = &reloaded.entries["shell_history//a.log"];
        assert_eq!(
            mark.extra,
            vec!["2024-03-05 09:30:01".to_string(), "42".to_string()]
        );
    }

    #[test]
    fn test_malformed_store_line_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("marks.csv");
        std::fs::write(&store, "only-one-field\n").unwrap();
        assert!(ChangeTracker::open(&store, false).is_err());
    }

    #[test]
    fn test_disabled_tracker_always_first_seen() {
        let dir = tempfile::tempdir().unwrap();
        let source = touch(dir.path(), "a.log");
        let mut tracker = ChangeTracker::disabled();
        assert_eq!(
            tracker.needs_processing("r//a", &source).unwrap(),
            Verdict::FirstSeen
        );
        tracker.update("r//a", &source, vec![]).unwrap();
        assert_eq!(
            tracker.needs_processing("r//a", &source).unwrap(),
            Verdict::FirstSeen
        );
    }
}
