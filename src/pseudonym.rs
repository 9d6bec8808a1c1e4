//! Collision-free pseudonymization of personal identifiers
//!
//! A raw identifier is mapped to the shortest free prefix of a keyed
//! SHA-256 digest, starting at a configured minimum length and growing
//! one character at a time past already-assigned pseudonyms. Synonyms of
//! one person (caller-supplied or found in the external directory) are
//! kept in a union-find so every member resolves to one shared
//! pseudonym, regardless of the order the synonyms were discovered in.
//! An assigned pseudonym is never lengthened retroactively, even when a
//! later collision would in principle call for disambiguation.

use std::collections::{HashMap, HashSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use sha2::{Digest as _, Sha256};
use tracing::warn;

use crate::directory::Directory;
use crate::error::{ConfigError, DataError, Result};
use crate::rules::RuleSet;

/// The pseudonym table. One per process; mutated in place during the
/// run, flushed to disk once at normal exit.
pub struct Pseudonymizer {
    store_path: Option<PathBuf>,
    secret: String,
    min_length: usize,
    directory: Box<dyn Directory>,
    /// identifier -> union-find slot
    slots: HashMap<String, usize>,
    parent: Vec<usize>,
    /// pseudonym carried by each root slot
    token: Vec<Option<String>>,
    /// every pseudonym in use, for prefix probing
    assigned: HashSet<String>,
}

impl std::fmt::Debug for Pseudonymizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pseudonymizer")
            .field("identifiers", &self.slots.len())
            .field("min_length", &self.min_length)
            .finish()
    }
}

impl Pseudonymizer {
    /// Build from the `pseudonymize` rule options: `file` (persisted
    /// table, empty disables persistence), `secret` (digest key),
    /// `min_length` (starting prefix length).
    pub fn from_rules(rules: &RuleSet, rule: &str, directory: Box<dyn Directory>) -> Result<Self> {
        let file = rules.get_property(rule, "file")?;
        let secret = rules.get_property(rule, "secret")?;
        let min_length = rules.get_int_property(rule, "min_length")?;
        if min_length < 1 {
            return Err(ConfigError::InvalidValue {
                rule: rule.to_string(),
                option: "min_length".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }

        let mut this = Self::with_config(secret, min_length as usize, directory);
        if !file.is_empty() {
            let path = PathBuf::from(&file);
            if path.exists() {
                this.load(&path)?;
            }
            this.store_path = Some(path);
        }
        Ok(this)
    }

    /// Build directly, without persistence.
    pub fn with_config(secret: String, min_length: usize, directory: Box<dyn Directory>) -> Self {
        Self {
            store_path: None,
            secret,
            min_length,
            directory,
            slots: HashMap::new(),
            parent: Vec::new(),
            token: Vec::new(),
            assigned: HashSet::new(),
        }
    }

    /// The pseudonym already assigned to an identifier, if any.
    pub fn lookup(&self, identifier: &str) -> Option<String> {
        let slot = *self.slots.get(identifier.trim())?;
        self.token[self.find_readonly(slot)].clone()
    }

    /// The keyed digest an identifier's pseudonym is cut from.
    pub fn keyed_digest(&self, identifier: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(identifier.as_bytes());
        hasher.update(self.secret.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Return the pseudonym for `identifier`, assigning one if needed.
    ///
    /// A fresh assignment takes the shortest free prefix of the keyed
    /// digest. The identifier, any caller-supplied synonyms, and any
    /// directory synonyms are unioned; if any member already carries a
    /// pseudonym, that one is reused (the smallest, when several groups
    /// merge) and propagated to every member.
    pub fn find_or_encode(&mut self, identifier: &str, synonyms: &[String]) -> Result<String> {
        let value = identifier.trim();
        if let Some(existing) = self.lookup(value) {
            return Ok(existing);
        }

        let digest = self.keyed_digest(value);
        let mut length = self.min_length.min(digest.len());
        while length < digest.len() && self.assigned.contains(&digest[..length]) {
            length += 1;
        }
        let candidate = digest[..length].to_string();

        let mut members: Vec<String> = vec![value.to_string()];
        match self.directory.synonyms(value) {
            Ok(found) => members.extend(found.into_iter().filter(|s| !s.is_empty())),
            Err(err) => warn!("synonym lookup degraded: {err}"),
        }
        members.extend(
            synonyms
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        );
        let mut seen = HashSet::new();
        members.retain(|m| seen.insert(m.clone()));

        // Reuse the pseudonym of any member that already has one.
        let mut existing: Vec<String> = members.iter().filter_map(|m| self.lookup(m)).collect();
        existing.sort();
        let pseudonym = existing.into_iter().next().unwrap_or(candidate);

        let first = self.slot(&members[0]);
        let mut root = self.find(first);
        for member in members.iter().skip(1) {
            let slot = self.slot(member);
            root = self.union(root, slot);
        }
        self.token[root] = Some(pseudonym.clone());
        self.assigned.insert(pseudonym.clone());
        Ok(pseudonym)
    }

    /// Load the persisted `identifier,pseudonym` table. Identifiers
    /// sharing a pseudonym are one identity and are unioned on load.
    fn load(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        let mut token_root: HashMap<String, usize> = HashMap::new();
        for line in text.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split(',');
            let (identifier, pseudonym) = match (fields.next(), fields.next()) {
                (Some(id), Some(token)) if !id.is_empty() && !token.is_empty() => (id, token),
                _ => {
                    return Err(DataError::MalformedStore {
                        file: path.display().to_string(),
                        line: line.to_string(),
                    }
                    .into())
                }
            };
            let slot = self.slot(identifier);
            match token_root.get(pseudonym).copied() {
                Some(other) => {
                    let root = self.union(slot, other);
                    token_root.insert(pseudonym.to_string(), root);
                }
                None => {
                    let root = self.find(slot);
                    self.token[root] = Some(pseudonym.to_string());
                    self.assigned.insert(pseudonym.to_string());
                    token_root.insert(pseudonym.to_string(), root);
                }
            }
        }
        Ok(())
    }

    /// Serialize the table, one `identifier,pseudonym` line per known
    /// identifier, sorted. Called once, at normal exit.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.store_path else {
            return Ok(());
        };
        let mut identifiers: Vec<&String> = self.slots.keys().collect();
        identifiers.sort();
        let mut out = std::fs::File::create(path)?;
        for identifier in identifiers {
            if let Some(token) = self.lookup(identifier) {
                writeln!(out, "{identifier},{token}")?;
            }
        }
        Ok(())
    }

    fn slot(&mut self, identifier: &str) -> usize {
        if let Some(&slot) = self.slots.get(identifier) {
            return slot;
        }
        let slot = self.parent.len();
        self.parent.push(slot);
        self.token.push(None);
        self.slots.insert(identifier.to_string(), slot);
        slot
    }

    fn find(&mut self, mut slot: usize) -> usize {
        while self.parent[slot] != slot {
            self.parent[slot] = self.parent[self.parent[slot]];
            slot = self.parent[slot];
        }
        slot
    }

    fn find_readonly(&self, mut slot: usize) -> usize {
        while self.parent[slot] != slot {
            slot = self.parent[slot];
        }
        slot
    }

    /// Join two sets. When both roots carry a pseudonym the smaller one
    /// survives, making convergence independent of discovery order.
    fn union(&mut self, a: usize, b: usize) -> usize {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return root_a;
        }
        let token_a = self.token[root_a].take();
        let token_b = self.token[root_b].take();
        let merged = match (token_a, token_b) {
            (Some(x), Some(y)) => Some(if x <= y { x } else { y }),
            (Some(x), None) | (None, Some(x)) => Some(x),
            (None, None) => None,
        };
        self.parent[root_b] = root_a;
        self.token[root_a] = merged;
        root_a
    }
}
