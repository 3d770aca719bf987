use crate::{
    actions::{ActionError, ActionReport, Executor},
    cancel::Cancellation,
    config::ConfigError,
    event::EventView,
    rules::{source::RuleSource, Rule},
    signature::{self, SignatureError},
};
use log::{debug, error, info, warn};
use thiserror::Error;

/// A custom error for dispatches that could not even look at the rules.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("cannot load the rules: {0}")]
    Config(#[from] ConfigError),
}

/// The result of the action of one matching rule.
#[derive(Debug)]
pub struct RuleRun {
    /// Position of the rule in the rules file.
    pub index: usize,
    pub result: Result<ActionReport, ActionError>,
}

/// What happened to an authorized event.
#[derive(Debug, Default)]
pub struct DispatchSummary {
    /// The number of rules that matched, with or without an action.
    pub matched: usize,
    pub runs: Vec<RuleRun>,
}

/// The outcome of one dispatch.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Every matching rule was authorized and its action attempted.
    Completed(DispatchSummary),
    /// A matching rule rejected the signature, no action was run.
    Unauthorized(SignatureError),
    /// There is no rules file to match against.
    NoRulesConfigured,
}

/// Matches events against the rules and runs their actions.
pub struct Dispatcher {
    rules: Box<dyn RuleSource>,
    executor: Executor,
}

impl Dispatcher {
    pub fn new(rules: Box<dyn RuleSource>, executor: Executor) -> Self {
        Dispatcher { rules, executor }
    }

    /// Dispatch one event.
    ///
    /// The rules are reloaded on every call. Every matching rule has to accept
    /// the signature before any action runs, and a single rejection fails the
    /// whole dispatch. Failing actions are recorded and do not stop the rules
    /// after them.
    pub fn dispatch(
        &self,
        event: &EventView,
        cancellation: &Cancellation,
    ) -> Result<DispatchOutcome, DispatchError> {
        let Some(rules) = self.rules.load()? else {
            info!("No rules are configured, ignoring the event.");
            return Ok(DispatchOutcome::NoRulesConfigured);
        };

        let matching: Vec<(usize, &Rule)> = rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.matches(event))
            .collect();
        debug!(
            "{} of {} rules match the {} event of {}.",
            matching.len(),
            rules.len(),
            event.event_type(),
            event.full_name().unwrap_or("an unknown repository")
        );

        for (index, rule) in &matching {
            if let Err(err) = signature::verify(
                rule.secret.as_deref(),
                event.raw_body(),
                event.signature(),
            ) {
                warn!("Rule #{index} rejected the event: {err}.");
                return Ok(DispatchOutcome::Unauthorized(err));
            }
        }

        let mut summary = DispatchSummary {
            matched: matching.len(),
            runs: vec![],
        };
        for (index, rule) in matching {
            if rule.actions.is_empty() {
                debug!("Rule #{index} has no actions.");
                continue;
            }
            if cancellation.is_cancelled() {
                warn!("Shutting down, skipping the remaining actions.");
                break;
            }

            let result = self.executor.run(rule, event, cancellation);
            if let Err(err) = &result {
                error!("Action of rule #{index} failed: {err}.");
            }
            summary.runs.push(RuleRun { index, result });
        }

        Ok(DispatchOutcome::Completed(summary))
    }
}
