//! Hierarchical rule namespace
//!
//! Rule files are INI-dialect text: `[rule.name]` sections of
//! `key = value` lines. Rules are hierarchical: `gcc_log.project1`
//! inherits every option it does not set from the longest declared
//! ancestor prefix. A `+key` prepends to the inherited value, `key+`
//! appends. Sections with the reserved `template` prefix pull other rule
//! files into the same namespace, in place; an `alias` option registers
//! alternate names for a rule. Both expansions detect cycles and report
//! the full chain. `%(name)s` references are substituted when a value is
//! set.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, PipelineError, ResolveError, Result};

/// Reserved section-name prefix for template rules.
const TEMPLATE_PREFIX: &str = "template";

/// Section name whose entries become file-scoped defaults.
const DEFAULT_SECTION: &str = "DEFAULT";

/// Substitution passes allowed before a value is declared circular.
const MAX_INTERPOLATION_DEPTH: usize = 10;

/// How an option line combines with the value it would inherit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combine {
    Override,
    Prepend,
    Append,
}

/// A parsed `[name]` section before it is applied to the namespace.
#[derive(Debug)]
struct RawSection {
    name: String,
    entries: Vec<(String, String)>,
}

/// The resolved rule namespace. Built once per invocation by loading
/// one or more rule files; read-only afterwards.
#[derive(Debug, Default)]
pub struct RuleSet {
    /// Explicitly set values, per rule name
    options: HashMap<String, HashMap<String, String>>,
    /// Rule names in file-declaration order, templates expanded in place
    order: Vec<String>,
    /// Alias name -> canonical rule name
    aliases: HashMap<String, String>,
    /// Engine-wide defaults, consulted last
    engine_defaults: HashMap<String, String>,
    /// `[DEFAULT]` entries accumulated across loaded files
    file_defaults: HashMap<String, String>,
}

impl RuleSet {
    /// Create a namespace with the given engine-wide default table.
    pub fn new(engine_defaults: HashMap<String, String>) -> Self {
        Self {
            engine_defaults,
            ..Self::default()
        }
    }

    /// Rule names in declaration order, template rules replaced by their
    /// expansion. The driver executes rules in exactly this order.
    pub fn rules(&self) -> &[String] {
        &self.order
    }

    /// Whether a rule name has any explicit option set.
    pub fn has_rule(&self, rule: &str) -> bool {
        self.options.contains_key(rule)
    }

    /// Load a rule file (and, through templates, everything it pulls in)
    /// into this namespace. Returns the rules loaded by this call in
    /// declaration order.
    pub fn load(&mut self, path: &Path) -> Result<Vec<String>> {
        let mut chain = Vec::new();
        self.load_inner(path, &mut chain)
    }

    fn load_inner(&mut self, path: &Path, chain: &mut Vec<PathBuf>) -> Result<Vec<String>> {
        let chain_labels = |chain: &[PathBuf]| -> Vec<String> {
            chain.iter().map(|p| p.display().to_string()).collect()
        };

        let canonical = std::fs::canonicalize(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
            chain: chain_labels(chain),
        })?;

        if chain.contains(&canonical) {
            let mut reported = chain_labels(chain);
            reported.push(canonical.display().to_string());
            return Err(ConfigError::CircularInclude { chain: reported }.into());
        }
        chain.push(canonical.clone());

        let text =
            std::fs::read_to_string(&canonical).map_err(|_| ConfigError::FileNotFound {
                path: path.display().to_string(),
                chain: chain_labels(&chain[..chain.len() - 1]),
            })?;

        let file_label = path.display().to_string();
        let (sections, defaults) = parse_sections(&text, &file_label)?;
        for (key, value) in defaults {
            self.file_defaults.insert(key, value);
        }

        let mut loaded = Vec::new();
        for section in sections {
            let root = section.name.split('.').next().unwrap_or("");
            if root == TEMPLATE_PREFIX {
                loaded.extend(self.expand_template(&section, &canonical, &file_label, chain)?);
            } else {
                self.apply_section(&section, &file_label)?;
                self.order.push(section.name.clone());
                loaded.push(section.name);
            }
        }
        Ok(loaded)
    }

    /// Expand a template section: load every referenced file, relative
    /// paths resolved against the including file. The template itself is
    /// never retained.
    fn expand_template(
        &mut self,
        section: &RawSection,
        including: &Path,
        file_label: &str,
        chain: &mut Vec<PathBuf>,
    ) -> Result<Vec<String>> {
        if section.entries.len() != 1 || section.entries[0].0 != "files" {
            return Err(ConfigError::BadTemplate {
                file: file_label.to_string(),
            }
            .into());
        }
        let value = self.interpolate(&section.name, "files", &section.entries[0].1)?;
        let base = including.parent().unwrap_or_else(|| Path::new("."));

        let mut loaded = Vec::new();
        for name in value.split_whitespace() {
            let target = if Path::new(name).is_absolute() {
                PathBuf::from(name)
            } else {
                base.join(name)
            };
            loaded.extend(self.load_inner(&target, chain)?);
        }
        Ok(loaded)
    }

    /// Apply one parsed section to the namespace: alias-expand the name,
    /// check option legality against the root rule and the default
    /// tables, combine prepend/append values with the inherited ones.
    fn apply_section(&mut self, section: &RawSection, file: &str) -> Result<()> {
        let unaliased = self.expand_alias(&section.name)?;
        let root = unaliased.split('.').next().unwrap_or(&unaliased).to_string();

        if !self.options.contains_key(&root) {
            return Err(ConfigError::UnknownRule {
                file: file.to_string(),
                rule: root,
            }
            .into());
        }

        for (raw_key, raw_value) in &section.entries {
            let (key, combine) = classify_key(raw_key);

            // Legal when declared anywhere in the ancestor chain or in a
            // default table.
            let legal = key == "alias" || self.get_property(&unaliased, key).is_ok();
            if !legal {
                return Err(ConfigError::UnknownOption {
                    file: file.to_string(),
                    rule: section.name.clone(),
                    option: key.to_string(),
                }
                .into());
            }

            let value = match combine {
                Combine::Override => raw_value.clone(),
                Combine::Prepend => {
                    let inherited = self.inherited_for(&unaliased, key, file, &section.name)?;
                    format!("{raw_value} {inherited}")
                }
                Combine::Append => {
                    let inherited = self.inherited_for(&unaliased, key, file, &section.name)?;
                    format!("{inherited} {raw_value}")
                }
            };

            let final_value = self.store(&unaliased, key, &value)?;

            if key == "alias" {
                for alias in final_value.split_whitespace() {
                    self.aliases.insert(alias.to_string(), unaliased.clone());
                }
            }
        }
        Ok(())
    }

    fn inherited_for(
        &self,
        rule: &str,
        option: &str,
        file: &str,
        section: &str,
    ) -> Result<String> {
        self.get_property(rule, option)
            .map_err(|_| {
                ConfigError::UnknownOption {
                    file: file.to_string(),
                    rule: section.to_string(),
                    option: option.to_string(),
                }
                .into()
            })
    }

    /// Set a value directly. `create_rule` allows introducing a new root
    /// rule, `create_option` an option not declared anywhere in the
    /// ancestor chain; the driver uses both to register module defaults.
    /// Returns the value after interpolation.
    pub fn set_property(
        &mut self,
        rule: &str,
        option: &str,
        value: &str,
        create_rule: bool,
        create_option: bool,
    ) -> Result<String> {
        let root = rule.split('.').next().unwrap_or(rule).to_string();
        if !create_rule && !self.options.contains_key(&root) {
            return Err(ConfigError::UnknownRule {
                file: "<set_property>".to_string(),
                rule: root,
            }
            .into());
        }
        if !create_option && self.get_property(rule, option).is_err() {
            return Err(ConfigError::UnknownOption {
                file: "<set_property>".to_string(),
                rule: rule.to_string(),
                option: option.to_string(),
            }
            .into());
        }
        self.store(rule, option, value)
    }

    fn store(&mut self, rule: &str, option: &str, value: &str) -> Result<String> {
        let resolved = self.interpolate(rule, option, value)?;
        self.options
            .entry(rule.to_string())
            .or_default()
            .insert(option.to_string(), resolved.clone());
        Ok(resolved)
    }

    /// Resolve an option for a rule: walk from the full name upward
    /// through successively shorter dotted prefixes, first explicit
    /// value wins; then file defaults, then engine defaults.
    pub fn get_property(&self, rule: &str, option: &str) -> std::result::Result<String, ResolveError> {
        let mut partial = rule;
        loop {
            if let Some(value) = self.options.get(partial).and_then(|opts| opts.get(option)) {
                return Ok(value.clone());
            }
            match partial.rfind('.') {
                Some(pos) => partial = &partial[..pos],
                None => break,
            }
        }
        if let Some(value) = self.file_defaults.get(option) {
            return Ok(value.clone());
        }
        if let Some(value) = self.engine_defaults.get(option) {
            return Ok(value.clone());
        }
        Err(ResolveError::MissingProperty {
            rule: rule.to_string(),
            option: option.to_string(),
        })
    }

    /// Like [`get_property`](Self::get_property) but parsed as an
    /// integer, with the rule and option named on failure.
    pub fn get_int_property(&self, rule: &str, option: &str) -> Result<i64> {
        let raw = self.get_property(rule, option)?;
        raw.trim().parse::<i64>().map_err(|_| {
            ConfigError::InvalidValue {
                rule: rule.to_string(),
                option: option.to_string(),
                reason: format!("`{raw}` is not an integer"),
            }
            .into()
        })
    }

    /// Expand aliases in a dotted rule name: repeatedly, from most to
    /// least specific prefix, substitute registered alias targets,
    /// keeping the peeled suffix attached, until a fixpoint. A chain
    /// that returns to an already-applied name is a fatal cycle.
    pub fn expand_alias(&self, rule: &str) -> std::result::Result<String, ConfigError> {
        let mut head = rule.to_string();
        let mut old_head: Option<String> = None;
        let mut applied: Vec<String> = Vec::new();

        while old_head.as_deref() != Some(head.as_str()) {
            old_head = Some(head.clone());

            let mut tail = String::new();
            while !head.is_empty() {
                if let Some(target) = self.aliases.get(&head) {
                    // A self-referential target, or re-applying any name
                    // already substituted in this expansion, can never
                    // reach a fixpoint.
                    if *target == head || applied.contains(target) || applied.contains(&head) {
                        let mut chain = applied.clone();
                        chain.push(head.clone());
                        chain.push(target.clone());
                        return Err(ConfigError::CircularAlias { chain });
                    }
                    applied.push(head.clone());
                    head = target.clone();
                    break;
                }
                // No hit: peel the last segment onto the tail and retry
                // with the shorter prefix.
                match head.rfind('.') {
                    Some(pos) => {
                        tail = format!("{}{}", &head[pos..], tail);
                        head.truncate(pos);
                    }
                    None => {
                        tail = format!("{head}{tail}");
                        head.clear();
                    }
                }
            }
            head.push_str(&tail);
        }
        Ok(head)
    }

    /// Substitute `%(name)s` references against the same rule's
    /// hierarchy; `%%` escapes a literal percent.
    fn interpolate(
        &self,
        rule: &str,
        option: &str,
        value: &str,
    ) -> std::result::Result<String, ResolveError> {
        let mut current = value.to_string();
        let mut depth = 0;
        while current.contains("%(") {
            depth += 1;
            if depth > MAX_INTERPOLATION_DEPTH {
                return Err(ResolveError::DepthExceeded {
                    rule: rule.to_string(),
                    option: option.to_string(),
                });
            }
            current = self.interpolate_pass(rule, option, &current)?;
        }
        Ok(current.replace("%%", "%"))
    }

    fn interpolate_pass(
        &self,
        rule: &str,
        option: &str,
        value: &str,
    ) -> std::result::Result<String, ResolveError> {
        let bad_reference = |name: &str| ResolveError::BadReference {
            rule: rule.to_string(),
            option: option.to_string(),
            name: name.to_string(),
        };

        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(idx) = rest.find('%') {
            out.push_str(&rest[..idx]);
            let after = &rest[idx + 1..];
            if let Some(tail) = after.strip_prefix('%') {
                // Keep the escape for later passes; unescaped at the end.
                out.push_str("%%");
                rest = tail;
            } else if let Some(reference) = after.strip_prefix('(') {
                let close = reference.find(')').ok_or_else(|| bad_reference(reference))?;
                let name = &reference[..close];
                let tail = &reference[close + 1..];
                let tail = tail.strip_prefix('s').ok_or_else(|| bad_reference(name))?;
                let replacement = self
                    .get_property(rule, name)
                    .map_err(|_| bad_reference(name))?;
                out.push_str(&replacement);
                rest = tail;
            } else {
                out.push('%');
                rest = after;
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Render the resolved namespace, declaration order, explicit
    /// options only.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let mut seen = HashSet::new();
        for name in &self.order {
            if !seen.insert(name.clone()) {
                continue;
            }
            let resolved = self.expand_alias(name).unwrap_or_else(|_| name.clone());
            out.push_str(&format!("[{name}]\n"));
            if let Some(opts) = self.options.get(&resolved) {
                let mut keys: Vec<&String> = opts.keys().collect();
                keys.sort();
                for key in keys {
                    out.push_str(&format!("  {key} = {}\n", opts[key]));
                }
            }
        }
        out
    }
}

/// Split a raw option key into its name and combine mode. `+key`
/// prepends, `key+` appends, anything else overrides.
fn classify_key(raw: &str) -> (&str, Combine) {
    if let Some(stripped) = raw.strip_prefix('+') {
        if !raw.ends_with('+') {
            return (stripped, Combine::Prepend);
        }
    } else if let Some(stripped) = raw.strip_suffix('+') {
        return (stripped, Combine::Append);
    }
    (raw, Combine::Override)
}

/// Parse the INI dialect: `[name]` headers, `key = value` (or
/// `key: value`) entries, indented continuation lines folded with one
/// space, `#`/`;` comments. Returns the sections in file order and the
/// `[DEFAULT]` entries separately.
fn parse_sections(
    text: &str,
    file: &str,
) -> std::result::Result<(Vec<RawSection>, Vec<(String, String)>), PipelineError> {
    let mut sections: Vec<RawSection> = Vec::new();
    let mut defaults: Vec<(String, String)> = Vec::new();
    let mut in_default = false;

    let syntax = |line: usize, reason: &str| -> PipelineError {
        ConfigError::Syntax {
            file: file.to_string(),
            line,
            reason: reason.to_string(),
        }
        .into()
    };

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = raw_line.trim_end();
        if trimmed.trim_start().is_empty() {
            continue;
        }
        if trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }

        // Continuation: indented line extending the previous value.
        if raw_line.starts_with(' ') || raw_line.starts_with('\t') {
            let continued = trimmed.trim_start();
            let entry = if in_default {
                defaults.last_mut()
            } else {
                sections.last_mut().and_then(|s| s.entries.last_mut())
            };
            match entry {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(continued);
                }
                None => return Err(syntax(line_no, "continuation without a preceding option")),
            }
            continue;
        }

        if let Some(header) = trimmed.strip_prefix('[') {
            let name = header
                .strip_suffix(']')
                .ok_or_else(|| syntax(line_no, "unterminated section header"))?
                .trim();
            if name.is_empty() {
                return Err(syntax(line_no, "empty section name"));
            }
            if name == DEFAULT_SECTION {
                in_default = true;
            } else {
                in_default = false;
                sections.push(RawSection {
                    name: name.to_string(),
                    entries: Vec::new(),
                });
            }
            continue;
        }

        let delim = trimmed
            .char_indices()
            .find(|(_, c)| *c == '=' || *c == ':')
            .map(|(i, _)| i)
            .ok_or_else(|| syntax(line_no, "expected `key = value`"))?;
        let key = trimmed[..delim].trim().to_string();
        let value = trimmed[delim + 1..].trim().to_string();
        if key.is_empty() {
            return Err(syntax(line_no, "empty option name"));
        }

        if in_default {
            defaults.push((key, value));
        } else {
            match sections.last_mut() {
                Some(section) => section.entries.push((key, value)),
                None => return Err(syntax(line_no, "option outside any section")),
            }
        }
    }

    Ok((sections, defaults))
}
