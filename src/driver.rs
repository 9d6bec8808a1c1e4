//! Driver: one batch run from rule file to persisted state
//!
//! Builds the rule namespace (engine defaults, module defaults, the
//! rule file itself), configures the service components (change
//! tracker, synonym directory, pseudonymizer, sink dispatcher), then
//! executes the selected producer rules in file-declaration order: every
//! setup first, then every run. The watermark and pseudonym tables are
//! persisted only when the whole run completed; any fatal error
//! terminates the process before that point and discards them.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::change_tracker::ChangeTracker;
use crate::directory::{Directory, FileDirectory, NoDirectory};
use crate::dispatch::Dispatcher;
use crate::error::{ConfigError, Result};
use crate::producer::{ProducerContext, ProducerRegistry};
use crate::pseudonym::Pseudonymizer;
use crate::rules::RuleSet;
use crate::stats::RunStats;

/// Rule names of the service modules the driver configures itself,
/// before any producer pass.
pub const PSEUDONYMIZE_RULE: &str = "pseudonymize";
pub const SINK_RULE: &str = "sink";
pub const DIRECTORY_RULE: &str = "directory";

/// Options legal for every rule.
fn engine_defaults() -> HashMap<String, String> {
    [
        ("debug", "0"),
        ("file_modification_cache", ""),
        ("from_date", ""),
        ("until_date", ""),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Register the service modules' option tables.
fn declare_service_defaults(rules: &mut RuleSet) -> Result<()> {
    for (option, value) in [("file", ""), ("secret", ""), ("min_length", "9")] {
        rules.set_property(PSEUDONYMIZE_RULE, option, value, true, true)?;
    }
    rules.set_property(DIRECTORY_RULE, "file", "", true, true)?;
    for (option, value) in [
        ("format", "csv"),
        ("output_file", ""),
        ("print_ordinal", ""),
        ("db_file", ""),
        ("exclude_users", ""),
    ] {
        rules.set_property(SINK_RULE, option, value, true, true)?;
    }
    Ok(())
}

/// Build the namespace for a run: engine defaults, every registered
/// module's option table, then the rule file.
pub fn load_rules(rules_file: &Path, registry: &ProducerRegistry) -> Result<RuleSet> {
    let mut rules = RuleSet::new(engine_defaults());
    declare_service_defaults(&mut rules)?;
    for producer in registry.iter() {
        for (option, value) in producer.defaults() {
            rules.set_property(producer.prefix(), option, value, true, true)?;
        }
    }
    rules.load(rules_file)?;
    Ok(rules)
}

/// Execute one batch run. `selected` restricts which producer rules run
/// (matched by full name, canonical name, or prefix); empty means all.
pub fn run(
    rules_file: &Path,
    selected: &[String],
    registry: &mut ProducerRegistry,
) -> Result<()> {
    let rules = load_rules(rules_file, registry)?;
    run_with_rules(&rules, selected, registry)
}

/// Like [`run`], over an already-built namespace.
pub fn run_with_rules(
    rules: &RuleSet,
    selected: &[String],
    registry: &mut ProducerRegistry,
) -> Result<()> {
    let store = rules.get_property(PSEUDONYMIZE_RULE, "file_modification_cache")?;
    let mut tracker = if store.is_empty() {
        ChangeTracker::disabled()
    } else {
        ChangeTracker::open(Path::new(&store), true)?
    };

    let directory_file = rules.get_property(DIRECTORY_RULE, "file")?;
    let directory: Box<dyn Directory> = if directory_file.is_empty() {
        Box::new(NoDirectory)
    } else {
        match FileDirectory::open(Path::new(&directory_file)) {
            Ok(loaded) => Box::new(loaded),
            Err(err) => {
                warn!("{err}; proceeding without synonyms");
                Box::new(NoDirectory)
            }
        }
    };

    let mut pseudonymizer = Pseudonymizer::from_rules(rules, PSEUDONYMIZE_RULE, directory)?;
    let mut dispatcher = Dispatcher::from_rules(rules, SINK_RULE, &mut pseudonymizer)?;
    let mut stats = RunStats::new();

    // Resolve the execution plan up front: canonical rule names in
    // file-declaration order, service rules handled above.
    let mut plan: Vec<(String, String)> = Vec::new();
    for rule in rules.rules() {
        let resolved = rules.expand_alias(rule)?;
        let prefix = resolved
            .split('.')
            .next()
            .unwrap_or(resolved.as_str())
            .to_string();
        if prefix == PSEUDONYMIZE_RULE || prefix == SINK_RULE || prefix == DIRECTORY_RULE {
            continue;
        }
        if !selected.is_empty()
            && !selected
                .iter()
                .any(|s| s == rule || *s == resolved || *s == prefix)
        {
            continue;
        }
        if !registry.contains(&prefix) {
            return Err(ConfigError::UnknownProducer { rule: resolved }.into());
        }
        plan.push((resolved, prefix));
    }

    for (rule, prefix) in &plan {
        debug!(rule = rule.as_str(), "setup");
        let producer = registry.get_mut(prefix).ok_or_else(|| {
            ConfigError::UnknownProducer {
                rule: rule.clone(),
            }
        })?;
        let mut ctx = ProducerContext {
            rules,
            tracker: &mut tracker,
            pseudonymizer: &mut pseudonymizer,
            dispatcher: &mut dispatcher,
            stats: &mut stats,
        };
        producer.setup(&mut ctx, rule)?;
    }

    for (rule, prefix) in &plan {
        info!(rule = rule.as_str(), "run");
        let producer = registry.get_mut(prefix).ok_or_else(|| {
            ConfigError::UnknownProducer {
                rule: rule.clone(),
            }
        })?;
        let mut ctx = ProducerContext {
            rules,
            tracker: &mut tracker,
            pseudonymizer: &mut pseudonymizer,
            dispatcher: &mut dispatcher,
            stats: &mut stats,
        };
        producer.run(&mut ctx, rule)?;
    }

    dispatcher.flush()?;

    // Normal exit: persist the run's state exactly once.
    tracker.save()?;
    pseudonymizer.save()?;

    for line in stats.render(dispatcher.counts()).lines() {
        info!("{line}");
    }
    Ok(())
}
