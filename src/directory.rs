//! External synonym directory seam
//!
//! The pseudonymizer asks a directory service for the other identifiers
//! a person is known by (login, full name, mail). The service is
//! optional and unreliable by design: any failure degrades to "no
//! synonyms known" at the caller.

use std::path::Path;

use crate::error::LookupError;

/// A source of identifier synonyms.
pub trait Directory {
    /// All identifiers naming the same person as `identifier`, or empty
    /// when the directory does not know it unambiguously.
    fn synonyms(&self, identifier: &str) -> Result<Vec<String>, LookupError>;
}

/// The disabled directory: never knows anything.
#[derive(Debug, Default)]
pub struct NoDirectory;

impl Directory for NoDirectory {
    fn synonyms(&self, _identifier: &str) -> Result<Vec<String>, LookupError> {
        Ok(Vec::new())
    }
}

/// A directory backed by a CSV export: one row per person, each field an
/// identifier for that person (login, common name, mail, ...).
#[derive(Debug)]
pub struct FileDirectory {
    rows: Vec<Vec<String>>,
}

impl FileDirectory {
    /// Load the export. An unreadable file is a lookup error the caller
    /// may degrade on.
    pub fn open(path: &Path) -> Result<Self, LookupError> {
        let text = std::fs::read_to_string(path).map_err(|err| LookupError::Unreachable {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        let rows = text
            .lines()
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| {
                line.split(',')
                    .map(|field| field.trim().to_string())
                    .filter(|field| !field.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|row: &Vec<String>| !row.is_empty())
            .collect();
        Ok(Self { rows })
    }
}

impl Directory for FileDirectory {
    fn synonyms(&self, identifier: &str) -> Result<Vec<String>, LookupError> {
        let mut matches = self
            .rows
            .iter()
            .filter(|row| row.iter().any(|field| field == identifier));
        let (first, second) = (matches.next(), matches.next());
        match (first, second) {
            // Exactly one record: return every identifier on the row.
            (Some(row), None) => Ok(row.clone()),
            // Unknown or ambiguous: no synonyms.
            _ => Ok(Vec::new()),
        }
    }
}
