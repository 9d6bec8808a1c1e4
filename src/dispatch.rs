//! Sink dispatcher
//!
//! The single funnel every canonical event passes through: shape is
//! enforced (fatal on violation), excluded users are dropped silently,
//! a per-run digest set gives at-most-once emission per sink per run,
//! the configured time window filters the rest, and whatever survives
//! is written to exactly one sink.

use std::collections::HashSet;

use chrono::NaiveDateTime;
use tracing::debug;

use crate::csv_output::CsvSink;
use crate::error::{ConfigError, Result, SinkError};
use crate::event::CanonicalEvent;
use crate::json_output::JsonlSink;
use crate::producer::window_dates;
use crate::pseudonym::Pseudonymizer;
use crate::rules::RuleSet;
use crate::sqlite_output::SqliteSink;
use crate::stats::DispatchCounts;

/// A destination for canonical events. The dispatcher owns exactly one.
pub trait EventSink {
    /// Write one event. `hash` is the event's content digest, for sinks
    /// that keep a persistent dedup column.
    fn write_event(
        &mut self,
        event: &CanonicalEvent,
        hash: &str,
    ) -> std::result::Result<(), SinkError>;

    /// Commit whatever the sink buffered. Called once, at normal exit.
    fn flush(&mut self) -> std::result::Result<(), SinkError>;
}

/// The dispatcher. One per process.
pub struct Dispatcher {
    sink: Box<dyn EventSink>,
    /// Content digests written this run
    seen: HashSet<String>,
    /// Pseudonymized users whose events are dropped
    exclude: HashSet<String>,
    window: (NaiveDateTime, NaiveDateTime),
    counts: DispatchCounts,
}

impl Dispatcher {
    /// Build from the sink rule options: `format` selects the sink,
    /// `exclude_users` raw identifiers are pseudonymized here so they
    /// match the events' user field, `from_date`/`until_date` bound the
    /// emission window.
    pub fn from_rules(
        rules: &RuleSet,
        rule: &str,
        pseudonymizer: &mut Pseudonymizer,
    ) -> Result<Self> {
        let format = rules.get_property(rule, "format")?;
        let window = window_dates(rules, rule)?;

        let mut exclude = HashSet::new();
        for raw in rules.get_property(rule, "exclude_users")?.split_whitespace() {
            exclude.insert(pseudonymizer.find_or_encode(raw, &[])?);
        }

        let require = |option: &str| -> Result<String> {
            let value = rules.get_property(rule, option)?;
            if value.is_empty() {
                return Err(ConfigError::InvalidValue {
                    rule: rule.to_string(),
                    option: option.to_string(),
                    reason: format!("required for the {format} format"),
                }
                .into());
            }
            Ok(value)
        };

        let sink: Box<dyn EventSink> = match format.as_str() {
            "csv" => {
                let output_file = rules.get_property(rule, "output_file")?;
                let ordinal = rules.get_property(rule, "print_ordinal")? == "yes";
                Box::new(CsvSink::create(&output_file, ordinal)?)
            }
            "sqlite" => Box::new(SqliteSink::open(&require("db_file")?)?),
            "jsonl" => Box::new(JsonlSink::open(&require("output_file")?)?),
            other => {
                return Err(ConfigError::InvalidValue {
                    rule: rule.to_string(),
                    option: "format".to_string(),
                    reason: format!("unknown sink format `{other}`"),
                }
                .into())
            }
        };

        Ok(Self::with_sink(sink, window, exclude))
    }

    /// Build around an already-open sink.
    pub fn with_sink(
        sink: Box<dyn EventSink>,
        window: (NaiveDateTime, NaiveDateTime),
        exclude: HashSet<String>,
    ) -> Self {
        Self {
            sink,
            seen: HashSet::new(),
            exclude,
            window,
            counts: DispatchCounts::default(),
        }
    }

    /// Pass one event through the funnel.
    pub fn out(&mut self, event: &CanonicalEvent) -> Result<()> {
        event.validate()?;

        if self.exclude.contains(&event.user) {
            self.counts.excluded += 1;
            return Ok(());
        }

        let hash = event.content_hash();
        if !self.seen.insert(hash.clone()) {
            self.counts.duplicates += 1;
            debug!(name = %event.name, "duplicate event dropped");
            return Ok(());
        }

        if event.datetime < self.window.0 || event.datetime > self.window.1 {
            self.counts.outside_window += 1;
            return Ok(());
        }

        self.sink.write_event(event, &hash)?;
        self.counts.emitted += 1;
        Ok(())
    }

    /// Flush the sink. Called once, at normal exit.
    pub fn flush(&mut self) -> Result<()> {
        self.sink.flush()?;
        Ok(())
    }

    pub fn counts(&self) -> &DispatchCounts {
        &self.counts
    }
}
