use crate::event::{path::lookup_or, EventView};
use log::trace;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// Loading the rules from the rules file.
pub mod source;

/// The event type a rule reacts to when it doesn't list any.
pub const DEFAULT_EVENT_TYPE: &str = "push";

/// One configured policy: which events it reacts to and what it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    /// Event types (`X-GitHub-Event` values) that trigger this rule.
    pub event_types: HashSet<String>,
    /// Full `owner/name` repository identifiers. A rule without repos never matches.
    pub repos: HashSet<String>,
    /// Dotted payload paths and the values they must hold.
    pub filters: BTreeMap<String, Value>,
    /// Shared key for the signature. Without it, requests must not be signed.
    pub secret: Option<String>,
    /// Command lines to run in order. Without any, the rule only matches.
    pub actions: Vec<String>,
    /// Whether the repository is checked out before running the action.
    pub clone: bool,
}

impl Default for Rule {
    fn default() -> Self {
        Rule {
            event_types: HashSet::from([DEFAULT_EVENT_TYPE.to_string()]),
            repos: HashSet::new(),
            filters: BTreeMap::new(),
            secret: None,
            actions: vec![],
            clone: true,
        }
    }
}

impl Rule {
    /// Decide whether this rule applies to the event.
    ///
    /// The event type, the repository and every filter have to match.
    pub fn matches(&self, event: &EventView) -> bool {
        if !self.event_types.contains(event.event_type()) {
            trace!("Event type {} is not handled.", event.event_type());
            return false;
        }

        match event.full_name() {
            Some(full_name) if self.repos.contains(full_name) => {}
            _ => return false,
        }

        self.filters.iter().all(|(path, expected)| {
            let actual = lookup_or(event.payload(), path, &Value::Null);
            let is_matching = filter_matches(actual, expected);
            if !is_matching {
                trace!("Filter {path} expected {expected}, found {actual}.");
            }
            is_matching
        })
    }
}

fn filter_matches(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }

    match actual {
        Value::Array(values) => values.contains(expected),
        _ => false,
    }
}
