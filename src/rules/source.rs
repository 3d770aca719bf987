use super::{Rule, DEFAULT_EVENT_TYPE};
use crate::config::{read_file, ConfigError};
use log::debug;
use mockall::automock;
use serde::Deserialize;
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashSet},
    path::PathBuf,
};

/// Where the dispatcher gets its rules from on every event.
#[automock]
pub trait RuleSource: Send + Sync {
    /// Load the current rules in declaration order.
    ///
    /// `None` means that no rules are configured at all, which is different
    /// from an empty list.
    fn load(&self) -> Result<Option<Vec<Rule>>, ConfigError>;
}

/// Rules read from a TOML file on every call, so edits apply without a restart.
pub struct FileRuleSource {
    path: Option<PathBuf>,
}

impl FileRuleSource {
    pub fn new(path: Option<PathBuf>) -> Self {
        FileRuleSource { path }
    }
}

impl RuleSource for FileRuleSource {
    fn load(&self) -> Result<Option<Vec<Rule>>, ConfigError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };

        let contents = read_file(path)?;
        let rules = parse_rules(&contents)
            .map_err(|err| ConfigError::Invalid(path.to_string_lossy().to_string(), err))?;
        debug!("Loaded {} rules from {}.", rules.len(), path.to_string_lossy());

        Ok(Some(rules))
    }
}

/// A fixed list of rules, mostly useful for embedding and testing.
pub struct StaticRuleSource(pub Option<Vec<Rule>>);

impl RuleSource for StaticRuleSource {
    fn load(&self) -> Result<Option<Vec<Rule>>, ConfigError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }

    fn into_set(self) -> HashSet<String> {
        self.into_vec().into_iter().collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleRecord {
    #[serde(default, alias = "repo")]
    repos: Option<OneOrMany>,
    #[serde(default, alias = "events")]
    event_types: Option<OneOrMany>,
    #[serde(default, alias = "filter")]
    filters: BTreeMap<String, Value>,
    #[serde(default, alias = "key")]
    secret: Option<String>,
    #[serde(default, alias = "action")]
    actions: Option<OneOrMany>,
    #[serde(default = "default_clone")]
    clone: bool,
}

fn default_clone() -> bool {
    true
}

impl From<RuleRecord> for Rule {
    fn from(record: RuleRecord) -> Self {
        Rule {
            event_types: record
                .event_types
                .map(OneOrMany::into_set)
                .unwrap_or_else(|| HashSet::from([DEFAULT_EVENT_TYPE.to_string()])),
            repos: record.repos.map(OneOrMany::into_set).unwrap_or_default(),
            filters: record.filters,
            secret: record.secret.filter(|secret| !secret.is_empty()),
            actions: record
                .actions
                .map(OneOrMany::into_vec)
                .unwrap_or_default()
                .into_iter()
                .filter(|action| !action.trim().is_empty())
                .collect(),
            clone: record.clone,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleFile {
    #[serde(default, rename = "rule", alias = "handler")]
    rules: Vec<RuleRecord>,
}

/// Parse the rules file.
///
/// ```toml
/// [[rule]]
/// repo = "org/x"
/// events = ["push"]
/// secret = "s3cr3t"
/// actions = ["make", "./deploy.sh production"]
/// clone = true
/// filter = { ref = "refs/heads/master" }
/// ```
pub fn parse_rules(contents: &str) -> Result<Vec<Rule>, toml::de::Error> {
    let file: RuleFile = toml::from_str(contents)?;

    Ok(file.rules.into_iter().map(Rule::from).collect())
}
