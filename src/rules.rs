//! Rule Store (C2): host -> regex -> option matching.

use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::ProxyError;

/// Action taken on a matched request/frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOption {
    ToStdout,
    UseLocalResponse,
    ToRedis,
}

impl RuleOption {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "to-stdout" => Some(Self::ToStdout),
            "use-local-response" => Some(Self::UseLocalResponse),
            "to-redis" => Some(Self::ToRedis),
            _ => None,
        }
    }
}

/// A single compiled rule. `uri_regex` is `None` when the source regex
/// failed to compile; such a rule is retained (matching the original's
/// behavior of logging-and-keeping) but can never match.
#[derive(Clone)]
pub struct Rule {
    pub host: String,
    pub uri_regex: Option<Regex>,
    pub option: RuleOption,
    pub content: String,
}

impl Rule {
    fn stdout_default() -> Self {
        Rule {
            host: String::new(),
            uri_regex: None,
            option: RuleOption::ToStdout,
            content: String::new(),
        }
    }
}

/// On-disk rule file shape (spec.md §6 "Rule file format").
#[derive(Debug, Deserialize)]
struct RuleFile {
    #[allow(dead_code)]
    version: String,
    rules: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    host: String,
    regex: String,
    option: String,
    #[serde(default)]
    content: String,
}

/// Default bucket key used when no host-specific rule matches.
const DEFAULT_BUCKET: &str = "default";

/// Immutable snapshot of host -> rule[] mappings plus an optional global
/// filter regex. Constructed once; safe to share read-only across tasks.
pub struct RuleStore {
    mode: StoreMode,
    /// `false` means "no rules loaded and no filter" — all traffic passes
    /// through untouched (spec.md §3 "RuleStore").
    pub enabled: bool,
}

enum StoreMode {
    Filter(Regex),
    Table(HashMap<String, Vec<Rule>>),
}

impl RuleStore {
    /// `new(rule_file_path, filter)` per spec.md §4.2.
    pub fn new(rule_file_path: Option<&Path>, filter: Option<&str>) -> Self {
        if let Some(pattern) = filter {
            if !pattern.is_empty() {
                if let Ok(re) = Regex::new(pattern) {
                    return RuleStore {
                        mode: StoreMode::Filter(re),
                        enabled: true,
                    };
                }
                eprintln!("warning: could not compile filter regex {pattern:?}; ignoring");
            }
        }

        let table = match rule_file_path {
            Some(p) => match load_rule_file(p) {
                Ok(rules) => rules,
                Err(e) => {
                    eprintln!("warning: {e}; disabling rule store");
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        };
        let enabled = !table.is_empty();

        RuleStore {
            mode: StoreMode::Table(table),
            enabled,
        }
    }

    /// Disabled store: no filter, no rules. All traffic passes untouched.
    pub fn disabled() -> Self {
        RuleStore {
            mode: StoreMode::Table(HashMap::new()),
            enabled: false,
        }
    }

    /// `match(host, uri) -> (Rule, bool)` per spec.md §3/§4.2.
    pub fn matches(&self, host: &str, uri: &str) -> (Rule, bool) {
        match &self.mode {
            StoreMode::Filter(re) => (Rule::stdout_default(), re.is_match(uri)),
            StoreMode::Table(table) => {
                if let Some(rules) = table.get(host) {
                    if let Some(r) = scan(rules, uri) {
                        return (r.clone(), true);
                    }
                }
                if let Some(rules) = table.get(DEFAULT_BUCKET) {
                    if let Some(r) = scan(rules, uri) {
                        return (r.clone(), true);
                    }
                }
                (Rule::stdout_default(), false)
            }
        }
    }
}

fn scan<'a>(rules: &'a [Rule], uri: &str) -> Option<&'a Rule> {
    rules
        .iter()
        .find(|r| r.uri_regex.as_ref().is_some_and(|re| re.is_match(uri)))
}

/// Load and parse the rule file, per spec.md §4.2 step 2. Both read and
/// parse failures surface as a `ProxyError::RuleFile` so the caller can
/// log a typed error and fall back to a disabled store.
fn load_rule_file(path: &Path) -> Result<HashMap<String, Vec<Rule>>, ProxyError> {
    let text = fs::read_to_string(path)
        .map_err(|e| ProxyError::RuleFile(format!("could not read {}: {e}", path.display())))?;
    let parsed: RuleFile = serde_yaml::from_str(&text)
        .map_err(|e| ProxyError::RuleFile(format!("could not parse {}: {e}", path.display())))?;

    let mut table: HashMap<String, Vec<Rule>> = HashMap::new();
    for raw in parsed.rules {
        let uri_regex = match Regex::new(&raw.regex) {
            Ok(re) => Some(re),
            Err(e) => {
                eprintln!(
                    "warning: rule for host {:?} has uncompilable regex {:?}: {e}",
                    raw.host, raw.regex
                );
                None
            }
        };
        let option = match RuleOption::parse(&raw.option) {
            Some(o) => o,
            None => {
                eprintln!(
                    "warning: rule for host {:?} has unknown option {:?}; treating as to-stdout",
                    raw.host, raw.option
                );
                RuleOption::ToStdout
            }
        };
        let rule = Rule {
            host: raw.host.clone(),
            uri_regex,
            option,
            content: raw.content,
        };
        table.entry(raw.host).or_default().push(rule);
    }

    Ok(table)
}
