//! Document-store sink
//!
//! Events are appended as JSON documents, one per line, to an events
//! collection file. Each event's user is resolved against a users
//! collection first and inserted there on first sight; the users
//! collection is rewritten at flush.

use std::collections::BTreeMap;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::dispatch::EventSink;
use crate::error::SinkError;
use crate::event::{CanonicalEvent, EVENT_TIME_FORMAT};

/// One event document.
#[derive(Debug, Serialize)]
struct EventDocument<'a> {
    name: &'a str,
    datetime: String,
    user: &'a str,
    hash: &'a str,
    attributes: Vec<AttributeDocument<'a>>,
}

/// Ordered attribute pair inside an event document.
#[derive(Debug, Serialize)]
struct AttributeDocument<'a> {
    key: &'a str,
    value: &'a str,
}

/// One user document in the users collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserDocument {
    pseudonym: String,
    first_seen: String,
}

/// Document-store sink backed by two JSON Lines collections.
pub struct JsonlSink {
    events: BufWriter<std::fs::File>,
    users_path: PathBuf,
    users: BTreeMap<String, UserDocument>,
}

impl JsonlSink {
    /// Open (appending) the events collection and load the users
    /// collection living next to it.
    pub fn open(events_file: &str) -> Result<Self, SinkError> {
        let events = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(events_file)
            .map_err(|err| SinkError::Open {
                dest: events_file.to_string(),
                source: err,
            })?;

        let users_path = PathBuf::from(format!("{events_file}.users"));
        let mut users = BTreeMap::new();
        if users_path.exists() {
            let text = std::fs::read_to_string(&users_path)?;
            for line in text.lines().filter(|l| !l.is_empty()) {
                let doc: UserDocument = serde_json::from_str(line)?;
                users.insert(doc.pseudonym.clone(), doc);
            }
        }

        Ok(Self {
            events: BufWriter::new(events),
            users_path,
            users,
        })
    }
}

impl EventSink for JsonlSink {
    fn write_event(&mut self, event: &CanonicalEvent, hash: &str) -> Result<(), SinkError> {
        let datetime = event.datetime.format(EVENT_TIME_FORMAT).to_string();

        // Resolve or insert the referenced user before the event record.
        self.users
            .entry(event.user.clone())
            .or_insert_with(|| UserDocument {
                pseudonym: event.user.clone(),
                first_seen: datetime.clone(),
            });

        let document = EventDocument {
            name: &event.name,
            datetime,
            user: &event.user,
            hash,
            attributes: event
                .attributes
                .iter()
                .map(|(key, value)| AttributeDocument { key, value })
                .collect(),
        };
        serde_json::to_writer(&mut self.events, &document)?;
        self.events.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.events.flush()?;
        let mut out = BufWriter::new(std::fs::File::create(&self.users_path)?);
        for doc in self.users.values() {
            serde_json::to_writer(&mut out, doc)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(())
    }
}
