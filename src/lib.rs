//! Receive GitHub webhooks, check out the pushed commit and run commands on it.
//!
//! ## How it works
//!
//! `gwh` is built up from **rules**, a **dispatcher** and **actions**.
//! Every webhook is turned into an event, which is matched against the rules
//! in the rules file. Every matching rule has to accept the signature of the
//! request, then the actions of the rules run one after the other, each in a
//! fresh temporary directory with the repository checked out at the pushed commit.
//!
//! ```ignore
//! +---------+       +-------+       +------------+       +--------+
//! | webhook | ----> | rules | ----> | repository | ----> | action |
//! +---------+       +-------+       +------------+       +--------+
//! ```
//!
//! Repositories are kept as bare mirrors in a cache directory, so every push
//! only fetches what changed.

/// An action is a command that runs for a matching rule (e.g. [running processes](actions::process::ProcessSpawner)).
pub mod actions;
/// Stopping long running fetches and processes.
pub mod cancel;
/// The service configuration file.
pub mod config;
/// Matching events against the rules and running the actions.
pub mod dispatch;
/// The webhook event and its payload.
pub mod event;
/// The cache of bare mirrors and the working trees checked out from it.
pub mod repository;
/// The rules that decide what runs for which event.
pub mod rules;
/// The HTTP server receiving the webhooks.
pub mod server;
/// Verifying the `X-Hub-Signature` of requests.
pub mod signature;
