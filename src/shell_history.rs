//! Shell history producer
//!
//! Scans timestamped shell history logs: `#<epoch>` lines carry the
//! timestamp of the command lines that follow. The user identifier is
//! the parent directory name of the log file; it is pseudonymized and
//! scrubbed out of the command text. Lines at or before the stored
//! watermark event time were emitted by a prior run and are skipped.
//! Events are named `shellcmd` with `program` and `command` attributes.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, NaiveDateTime};
use regex::Regex;
use tracing::{info, warn};

use crate::error::{ConfigError, Result};
use crate::event::{CanonicalEvent, EVENT_TIME_FORMAT};
use crate::producer::{files_to_process, window_dates, Producer, ProducerContext};

/// Per-rule state compiled during setup.
#[derive(Debug, Default)]
struct Compiled {
    /// Commands handled by other scanners, matched by basename
    skip_commands: HashSet<String>,
    /// Events whose command line matches are dropped
    drop_pattern: Option<Regex>,
}

/// The shell history scanner.
#[derive(Debug, Default)]
pub struct ShellHistoryProducer {
    compiled: HashMap<String, Compiled>,
}

impl ShellHistoryProducer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Producer for ShellHistoryProducer {
    fn prefix(&self) -> &'static str {
        "shell_history"
    }

    fn defaults(&self) -> &[(&'static str, &'static str)] {
        &[
            ("files", ""),
            ("skip_commands", ""),
            ("drop_pattern", ""),
        ]
    }

    fn setup(&mut self, ctx: &mut ProducerContext<'_>, rule: &str) -> Result<()> {
        let skip_commands: HashSet<String> = ctx
            .rules
            .get_property(rule, "skip_commands")?
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let raw_pattern = ctx.rules.get_property(rule, "drop_pattern")?;
        let drop_pattern = if raw_pattern.is_empty() {
            None
        } else {
            Some(Regex::new(&raw_pattern).map_err(|err| ConfigError::InvalidValue {
                rule: rule.to_string(),
                option: "drop_pattern".to_string(),
                reason: err.to_string(),
            })?)
        };

        self.compiled.insert(
            rule.to_string(),
            Compiled {
                skip_commands,
                drop_pattern,
            },
        );
        Ok(())
    }

    fn run(&mut self, ctx: &mut ProducerContext<'_>, rule: &str) -> Result<()> {
        let compiled = self.compiled.remove(rule).ok_or_else(|| {
            ConfigError::UnknownProducer {
                rule: rule.to_string(),
            }
        })?;
        let window = window_dates(ctx.rules, rule)?;
        let sources = files_to_process(ctx, rule)?;

        for source in sources {
            self.scan_file(ctx, rule, &compiled, &source, window)?;
        }
        self.compiled.insert(rule.to_string(), compiled);
        Ok(())
    }
}

impl ShellHistoryProducer {
    fn scan_file(
        &self,
        ctx: &mut ProducerContext<'_>,
        rule: &str,
        compiled: &Compiled,
        source: &crate::producer::SourceFile,
        window: (NaiveDateTime, NaiveDateTime),
    ) -> Result<()> {
        let Some(user_id) = directory_user(&source.path) else {
            warn!(rule, file = %source.path.display(), "no user directory in path, skipping");
            return Ok(());
        };
        let pseudonym = ctx.pseudonymizer.find_or_encode(&user_id, &[])?;

        let last_event = source.last_event.unwrap_or(NaiveDateTime::MIN);
        let mut newest = last_event;

        let bytes = std::fs::read(&source.path)?;
        let text = String::from_utf8_lossy(&bytes);

        let mut stamp: Option<NaiveDateTime> = None;
        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;

            if line.trim().is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix('#') {
                let rest = rest.trim();
                if rest.is_empty() {
                    continue;
                }
                match rest.parse::<f64>() {
                    Ok(epoch) => {
                        stamp = DateTime::from_timestamp(
                            epoch.trunc() as i64,
                            (epoch.fract() * 1e9) as u32,
                        )
                        .map(|dt| dt.naive_utc());
                        if stamp.is_none() {
                            warn!(rule, file = %source.path.display(), line = line_no,
                                  "timestamp out of range, skipping record");
                            ctx.stats.rule_mut(rule).records_malformed += 1;
                        }
                    }
                    Err(_) => {
                        warn!(rule, file = %source.path.display(), line = line_no,
                              "bad timestamp line, skipping record");
                        ctx.stats.rule_mut(rule).records_malformed += 1;
                        stamp = None;
                    }
                }
                continue;
            }

            let Some(at) = stamp else {
                warn!(rule, file = %source.path.display(), line = line_no,
                      "command without a preceding timestamp, skipping record");
                ctx.stats.rule_mut(rule).records_malformed += 1;
                continue;
            };

            // Already emitted by a prior run.
            if at <= last_event {
                continue;
            }
            if at < window.0 || at > window.1 {
                ctx.stats.rule_mut(rule).events_outside_window += 1;
                continue;
            }

            // The raw user id must never reach the sink.
            let scrubbed = if line.contains(user_id.as_str()) {
                line.replace(user_id.as_str(), &pseudonym)
            } else {
                line.to_string()
            };

            let mut fields = scrubbed.split_whitespace();
            let Some(program) = fields.next() else {
                continue;
            };
            let base = Path::new(program)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(program);
            if compiled.skip_commands.contains(base) || compiled.skip_commands.contains(program) {
                continue;
            }
            if let Some(pattern) = &compiled.drop_pattern {
                if pattern.is_match(&scrubbed) {
                    continue;
                }
            }

            if at > newest {
                newest = at;
            }

            let event = CanonicalEvent::new("shellcmd", at, pseudonym.clone())
                .attr("program", program)
                .attr("command", scrubbed.trim_end());
            ctx.dispatcher.out(&event)?;
            ctx.stats.rule_mut(rule).events_emitted += 1;
        }

        let resume = if newest > NaiveDateTime::MIN {
            newest
        } else {
            DateTime::from_timestamp(0, 0)
                .map(|dt| dt.naive_utc())
                .unwrap_or(NaiveDateTime::MIN)
        };
        ctx.tracker.update(
            &source.identifier,
            &source.path,
            vec![resume.format(EVENT_TIME_FORMAT).to_string()],
        )?;
        info!(rule, file = %source.path.display(), "scanned");
        Ok(())
    }
}

/// The user a log belongs to is the name of the directory holding it.
fn directory_user(path: &Path) -> Option<String> {
    path.parent()
        .and_then(|dir| dir.file_name())
        .and_then(|name| name.to_str())
        .map(str::to_string)
}
