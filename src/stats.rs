//! Run counters and the end-of-run summary

use std::collections::BTreeMap;

/// Counters kept per producer rule.
#[derive(Debug, Clone, Default)]
pub struct RuleCounts {
    /// Source files matched by the rule's patterns
    pub files_seen: u64,
    /// Files skipped as unmodified since the last run
    pub files_skipped: u64,
    /// Events handed to the dispatcher
    pub events_emitted: u64,
    /// Records dropped as malformed (logged, never fatal)
    pub records_malformed: u64,
    /// Events dropped by the producer's own window pre-filter
    pub events_outside_window: u64,
}

/// Counters kept by the dispatcher, across all rules.
#[derive(Debug, Clone, Default)]
pub struct DispatchCounts {
    pub emitted: u64,
    pub duplicates: u64,
    pub excluded: u64,
    pub outside_window: u64,
}

/// All counters for one run.
#[derive(Debug, Default)]
pub struct RunStats {
    rules: BTreeMap<String, RuleCounts>,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for a rule, created on first touch.
    pub fn rule_mut(&mut self, rule: &str) -> &mut RuleCounts {
        self.rules.entry(rule.to_string()).or_default()
    }

    /// Render the aligned summary table.
    pub fn render(&self, dispatch: &DispatchCounts) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{:<28} {:>7} {:>8} {:>8} {:>6}\n",
            "rule", "files", "skipped", "events", "bad"
        ));
        for (rule, counts) in &self.rules {
            out.push_str(&format!(
                "{:<28} {:>7} {:>8} {:>8} {:>6}\n",
                rule,
                counts.files_seen,
                counts.files_skipped,
                counts.events_emitted,
                counts.records_malformed
            ));
        }
        out.push_str(&format!(
            "sink: {} written, {} duplicate, {} excluded, {} outside window\n",
            dispatch.emitted, dispatch.duplicates, dispatch.excluded, dispatch.outside_window
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_counters_accumulate() {
        let mut stats = RunStats::new();
        stats.rule_mut("shell_history").events_emitted += 3;
        stats.rule_mut("shell_history").events_emitted += 2;
        assert_eq!(stats.rules["shell_history"].events_emitted, 5);
    }

    #[test]
    fn test_render_lists_rules_in_order() {
        let mut stats = RunStats::new();
        stats.rule_mut("b_rule").files_seen = 1;
        stats.rule_mut("a_rule").files_seen = 2;
        let table = stats.render(&DispatchCounts::default());
        let a = table.find("a_rule").unwrap();
        let b = table.find("b_rule").unwrap();
        assert!(a < b, "rules render sorted by name");
    }
}
