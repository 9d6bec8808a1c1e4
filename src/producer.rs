//! Producer contract and shared producer helpers
//!
//! A producer turns one kind of raw log file into canonical events. It
//! declares a rule-name prefix and a table of recognized options with
//! defaults, then implements two entry points: `setup` (read options,
//! compile patterns) and `run` (scan sources, emit events, report the
//! newest event time back to the change tracker). The driver resolves
//! producers through a registry once at startup and injects every
//! collaborator through [`ProducerContext`].

use std::path::PathBuf;

use chrono::NaiveDateTime;
use glob::glob;
use tracing::{info, warn};

use crate::change_tracker::{ChangeTracker, Verdict};
use crate::dispatch::Dispatcher;
use crate::error::{ConfigError, Result};
use crate::event::EVENT_TIME_FORMAT;
use crate::pseudonym::Pseudonymizer;
use crate::rules::RuleSet;
use crate::stats::RunStats;

/// Timestamp format of the `from_date`/`until_date` options.
pub const WINDOW_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Everything a producer may touch, injected per call.
pub struct ProducerContext<'a> {
    pub rules: &'a RuleSet,
    pub tracker: &'a mut ChangeTracker,
    pub pseudonymizer: &'a mut Pseudonymizer,
    pub dispatcher: &'a mut Dispatcher,
    pub stats: &'a mut RunStats,
}

/// One per-log-type scanner.
pub trait Producer {
    /// Default rule-name prefix this producer answers to.
    fn prefix(&self) -> &'static str;

    /// Recognized options and their default values, registered by the
    /// driver before the rule file loads.
    fn defaults(&self) -> &[(&'static str, &'static str)];

    /// Read options and compile parsing patterns. Runs for every
    /// selected rule, in declaration order, before any `run`.
    fn setup(&mut self, ctx: &mut ProducerContext<'_>, rule: &str) -> Result<()>;

    /// Scan every source the rule's file pattern matches and emit the
    /// resulting events through the dispatcher.
    fn run(&mut self, ctx: &mut ProducerContext<'_>, rule: &str) -> Result<()>;
}

/// Producer registry, resolved once at startup.
#[derive(Default)]
pub struct ProducerRegistry {
    producers: Vec<Box<dyn Producer>>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, producer: Box<dyn Producer>) {
        self.producers.push(producer);
    }

    /// The producer answering to a rule-name prefix.
    pub fn get_mut(&mut self, prefix: &str) -> Option<&mut Box<dyn Producer>> {
        self.producers.iter_mut().find(|p| p.prefix() == prefix)
    }

    pub fn contains(&self, prefix: &str) -> bool {
        self.producers.iter().any(|p| p.prefix() == prefix)
    }

    /// All registered producers, for defaults registration.
    pub fn iter(&self) -> impl Iterator<Item = &dyn Producer> {
        self.producers.iter().map(|p| p.as_ref())
    }
}

/// Resolve a rule's `from_date`/`until_date` options into a concrete
/// window; empty values open that side of the window.
pub fn window_dates(rules: &RuleSet, rule: &str) -> Result<(NaiveDateTime, NaiveDateTime)> {
    let parse = |option: &str, open: NaiveDateTime| -> Result<NaiveDateTime> {
        let raw = rules.get_property(rule, option)?;
        if raw.is_empty() {
            return Ok(open);
        }
        NaiveDateTime::parse_from_str(&raw, WINDOW_TIME_FORMAT).map_err(|_| {
            ConfigError::InvalidValue {
                rule: rule.to_string(),
                option: option.to_string(),
                reason: format!("`{raw}` does not match {WINDOW_TIME_FORMAT}"),
            }
            .into()
        })
    };
    Ok((
        parse("from_date", NaiveDateTime::MIN)?,
        parse("until_date", NaiveDateTime::MAX)?,
    ))
}

/// A source file that needs processing, with the newest event time a
/// prior run emitted for it (when known).
#[derive(Debug)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Tracker identifier, `rule//path`
    pub identifier: String,
    pub last_event: Option<NaiveDateTime>,
}

/// Expand the rule's `files` wildcards and filter the matches through
/// the change tracker. Unmodified sources are skipped here and counted;
/// everything else is returned with its stored resume point.
pub fn files_to_process(ctx: &mut ProducerContext<'_>, rule: &str) -> Result<Vec<SourceFile>> {
    let patterns = ctx.rules.get_property(rule, "files")?;

    let mut matched = Vec::new();
    for pattern in patterns.split_whitespace() {
        let paths = glob(pattern).map_err(|err| ConfigError::InvalidValue {
            rule: rule.to_string(),
            option: "files".to_string(),
            reason: err.to_string(),
        })?;
        for entry in paths {
            match entry {
                Ok(path) if path.is_file() => matched.push(path),
                Ok(_) => {}
                Err(err) => warn!(rule, "unreadable path while expanding files: {err}"),
            }
        }
    }
    matched.sort();
    matched.dedup();

    let mut sources = Vec::new();
    for path in matched {
        ctx.stats.rule_mut(rule).files_seen += 1;
        let identifier = format!("{rule}//{}", path.display());
        match ctx.tracker.needs_processing(&identifier, &path)? {
            Verdict::Unmodified => {
                info!(rule, file = %path.display(), "not modified, skipping");
                ctx.stats.rule_mut(rule).files_skipped += 1;
            }
            Verdict::FirstSeen => sources.push(SourceFile {
                path,
                identifier,
                last_event: None,
            }),
            Verdict::Modified(mark) => {
                let last_event = mark.extra.first().and_then(|raw| {
                    NaiveDateTime::parse_from_str(raw, EVENT_TIME_FORMAT)
                        .map_err(|_| {
                            warn!(rule, "unparsable watermark event time `{raw}`, rescanning");
                        })
                        .ok()
                });
                sources.push(SourceFile {
                    path,
                    identifier,
                    last_event,
                });
            }
        }
    }
    Ok(sources)
}
