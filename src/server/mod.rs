use crate::{
    cancel::Cancellation,
    dispatch::{DispatchOutcome, Dispatcher},
    event::EventView,
};
use log::{debug, error, info, warn};
use std::{
    io::Read,
    net::SocketAddr,
    sync::Arc,
    thread::{self, JoinHandle},
};
use thiserror::Error;
use tiny_http::{Method, Request, Response, Server};

/// Checking which callers may deliver webhooks.
pub mod source;

use source::SourceFilter;

pub const EVENT_HEADER: &str = "X-GitHub-Event";
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature";

/// A custom error describing the error cases of the HTTP server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The server cannot listen on the address.
    #[error("cannot start server on {0}: {1}")]
    CannotBind(String, String),
    /// The networks of the allowed callers cannot be fetched.
    #[error("cannot check the caller: {0}")]
    SourceCheckUnavailable(String),
}

/// The status and the plaintext body of one answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub body: String,
}

impl Reply {
    fn new(status: u16, body: &str) -> Self {
        Reply {
            status,
            body: body.to_string(),
        }
    }
}

/// Receives webhooks and hands them to the dispatcher, one thread per request.
pub struct WebhookServer {
    server: Arc<Server>,
    handler: Arc<RequestHandler>,
}

/// Stops a running [WebhookServer] from another thread.
#[derive(Clone)]
pub struct Unblocker(Arc<Server>);

impl Unblocker {
    pub fn unblock(&self) {
        self.0.unblock();
    }
}

impl WebhookServer {
    /// Listen on an address like "0.0.0.0:8080".
    pub fn bind(
        listen: &str,
        dispatcher: Dispatcher,
        sources: SourceFilter,
        cancellation: Cancellation,
    ) -> Result<Self, ServerError> {
        let server = Server::http(listen)
            .map_err(|err| ServerError::CannotBind(listen.to_string(), err.to_string()))?;

        Ok(WebhookServer {
            server: Arc::new(server),
            handler: Arc::new(RequestHandler {
                dispatcher,
                sources,
                cancellation,
            }),
        })
    }

    /// The address the server actually listens on.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.server_addr().to_ip()
    }

    pub fn unblocker(&self) -> Unblocker {
        Unblocker(Arc::clone(&self.server))
    }

    /// Serve until unblocked, then wait for the requests in flight.
    pub fn serve(&self) {
        info!(
            "Listening on {}...",
            self.local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| "an unknown address".to_string())
        );

        let mut in_flight: Vec<JoinHandle<()>> = vec![];
        for request in self.server.incoming_requests() {
            let handler = Arc::clone(&self.handler);
            in_flight.retain(|handle| !handle.is_finished());
            in_flight.push(thread::spawn(move || handler.respond(request)));
        }

        debug!("Waiting for {} requests to finish.", in_flight.len());
        for handle in in_flight {
            if handle.join().is_err() {
                error!("A request handler panicked.");
            }
        }
        info!("Server stopped.");
    }
}

struct RequestHandler {
    dispatcher: Dispatcher,
    sources: SourceFilter,
    cancellation: Cancellation,
}

impl RequestHandler {
    fn respond(&self, mut request: Request) {
        info!(
            "Received request on {} {} ({}).",
            request.method(),
            request.url(),
            header(&request, EVENT_HEADER).unwrap_or_default()
        );

        let reply = self.reply(&mut request);
        if reply.status >= 400 {
            debug!("Answering {} {}.", reply.status, reply.body);
        }

        let response = Response::from_string(reply.body).with_status_code(reply.status);
        if let Err(err) = request.respond(response) {
            error!("Failed answering the request: {err}.");
        }
    }

    fn reply(&self, request: &mut Request) -> Reply {
        let path = request.url().split('?').next().unwrap_or_default();
        if path != "/" {
            return Reply::new(404, "Not Found");
        }
        if request.method() != &Method::Post {
            return Reply::new(405, "Method Not Allowed");
        }

        if self.sources.is_enabled() {
            let Some(caller) = request.remote_addr().map(|addr| addr.ip()) else {
                return Reply::new(403, "Forbidden");
            };
            match self.sources.allows(caller) {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Rejected a request from {caller}.");
                    return Reply::new(403, "Forbidden");
                }
                Err(err) => {
                    error!("{err}.");
                    return Reply::new(503, "Service Unavailable");
                }
            }
        }

        let mut raw_body = vec![];
        if let Err(err) = request.as_reader().read_to_end(&mut raw_body) {
            warn!("Failed reading the request body: {err}.");
            return Reply::new(400, "Bad Request");
        }

        let event_type = header(request, EVENT_HEADER).unwrap_or_default();
        let signature = header(request, SIGNATURE_HEADER);
        let event = match EventView::parse(event_type, raw_body, signature) {
            Ok(event) => event,
            Err(err) => {
                warn!("Rejected a request: {err}.");
                return Reply::new(400, "Bad Request");
            }
        };

        match self.dispatcher.dispatch(&event, &self.cancellation) {
            Ok(DispatchOutcome::Completed(_)) if event.event_type() == "ping" => {
                Reply::new(200, "pong")
            }
            Ok(DispatchOutcome::Completed(_)) => Reply::new(200, "OK"),
            Ok(DispatchOutcome::NoRulesConfigured) => {
                Reply::new(200, "No handlers file available.")
            }
            Ok(DispatchOutcome::Unauthorized(_)) => Reply::new(403, "Forbidden"),
            Err(err) => {
                error!("{err}.");
                Reply::new(500, "Internal Server Error")
            }
        }
    }
}

fn header(request: &Request, name: &'static str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|header| header.field.equiv(name))
        .map(|header| header.value.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        actions::{ActionError, ExecutorConfig, ExitReport, Executor, MockSpawner},
        rules::{
            source::{FileRuleSource, StaticRuleSource},
            Rule,
        },
        signature::sign,
    };
    use std::{
        collections::HashSet,
        error::Error,
        fs,
        time::Duration,
    };

    const PUSH: &str = r#"{"ref": "refs/heads/master", "repository": {"full_name": "org/x"}}"#;

    fn executor(spawner: MockSpawner) -> Executor {
        Executor::new(
            ExecutorConfig {
                fetch_timeout: Duration::from_secs(10),
                ..ExecutorConfig::default()
            },
            Box::new(spawner),
        )
    }

    fn succeeding_spawner(times: usize) -> MockSpawner {
        let mut spawner = MockSpawner::new();
        spawner.expect_run().times(times).returning(|_, _| {
            Ok::<ExitReport, ActionError>(ExitReport {
                code: Some(0),
                output: String::new(),
            })
        });
        spawner
    }

    fn rule(secret: Option<&str>) -> Rule {
        Rule {
            event_types: HashSet::from(["push".to_string(), "ping".to_string()]),
            repos: HashSet::from(["org/x".to_string()]),
            secret: secret.map(str::to_string),
            actions: vec!["./run.sh".to_string()],
            clone: false,
            ..Rule::default()
        }
    }

    /// Start a server on a free port and return its URL.
    fn start(dispatcher: Dispatcher, sources: SourceFilter) -> Result<String, Box<dyn Error>> {
        let server = WebhookServer::bind("127.0.0.1:0", dispatcher, sources, Cancellation::new())?;
        let addr = server.local_addr().ok_or("no address")?;
        thread::spawn(move || server.serve());

        Ok(format!("http://{addr}"))
    }

    fn post(url: &str, event: &str, body: &str) -> Result<(u16, String), Box<dyn Error>> {
        let response = match ureq::post(url)
            .set(EVENT_HEADER, event)
            .send_string(body)
        {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(err) => return Err(err.into()),
        };

        Ok((response.status(), response.into_string()?))
    }

    #[test]
    fn it_should_only_serve_the_root() -> Result<(), Box<dyn Error>> {
        let dispatcher = Dispatcher::new(
            Box::new(StaticRuleSource(Some(vec![]))),
            executor(succeeding_spawner(0)),
        );
        let url = start(dispatcher, SourceFilter::disabled())?;

        assert_eq!(404, post(&format!("{url}/abc"), "push", PUSH)?.0);
        assert_eq!(404, post(&format!("{url}/ghi/jkl"), "push", PUSH)?.0);

        Ok(())
    }

    #[test]
    fn it_should_only_accept_post() -> Result<(), Box<dyn Error>> {
        let dispatcher = Dispatcher::new(
            Box::new(StaticRuleSource(Some(vec![]))),
            executor(succeeding_spawner(0)),
        );
        let url = start(dispatcher, SourceFilter::disabled())?;

        let status = match ureq::get(&url).call() {
            Ok(response) => response.status(),
            Err(ureq::Error::Status(status, _)) => status,
            Err(err) => return Err(err.into()),
        };
        assert_eq!(405, status);

        Ok(())
    }

    #[test]
    fn it_should_reject_invalid_json() -> Result<(), Box<dyn Error>> {
        let dispatcher = Dispatcher::new(
            Box::new(StaticRuleSource(Some(vec![]))),
            executor(succeeding_spawner(0)),
        );
        let url = start(dispatcher, SourceFilter::disabled())?;

        assert_eq!(400, post(&url, "push", "{not json")?.0);

        Ok(())
    }

    #[test]
    fn it_should_answer_pings() -> Result<(), Box<dyn Error>> {
        let dispatcher = Dispatcher::new(
            Box::new(StaticRuleSource(Some(vec![rule(None)]))),
            executor(succeeding_spawner(1)),
        );
        let url = start(dispatcher, SourceFilter::disabled())?;

        let (status, body) = post(&url, "ping", r#"{"repository": {"full_name": "org/x"}}"#)?;

        assert_eq!(200, status);
        assert_eq!("pong", body);

        Ok(())
    }

    #[test]
    fn it_should_run_pushes() -> Result<(), Box<dyn Error>> {
        let dispatcher = Dispatcher::new(
            Box::new(StaticRuleSource(Some(vec![rule(None)]))),
            executor(succeeding_spawner(1)),
        );
        let url = start(dispatcher, SourceFilter::disabled())?;

        let (status, body) = post(&url, "push", PUSH)?;

        assert_eq!(200, status);
        assert_eq!("OK", body);

        Ok(())
    }

    #[test]
    fn it_should_forbid_bad_signatures() -> Result<(), Box<dyn Error>> {
        let dispatcher = Dispatcher::new(
            Box::new(StaticRuleSource(Some(vec![rule(Some("s3cr3t"))]))),
            executor(succeeding_spawner(0)),
        );
        let url = start(dispatcher, SourceFilter::disabled())?;

        let response = match ureq::post(&url)
            .set(EVENT_HEADER, "push")
            .set(SIGNATURE_HEADER, &sign("wrong", PUSH.as_bytes())?)
            .send_string(PUSH)
        {
            Ok(response) => response.status(),
            Err(ureq::Error::Status(status, _)) => status,
            Err(err) => return Err(err.into()),
        };
        assert_eq!(403, response);

        Ok(())
    }

    #[test]
    fn it_should_accept_good_signatures() -> Result<(), Box<dyn Error>> {
        let dispatcher = Dispatcher::new(
            Box::new(StaticRuleSource(Some(vec![rule(Some("s3cr3t"))]))),
            executor(succeeding_spawner(1)),
        );
        let url = start(dispatcher, SourceFilter::disabled())?;

        let response = ureq::post(&url)
            .set(EVENT_HEADER, "push")
            .set(SIGNATURE_HEADER, &sign("s3cr3t", PUSH.as_bytes())?)
            .send_string(PUSH)?;
        assert_eq!(200, response.status());

        Ok(())
    }

    #[test]
    fn it_should_say_if_there_is_no_rules_file() -> Result<(), Box<dyn Error>> {
        let dispatcher = Dispatcher::new(
            Box::new(FileRuleSource::new(None)),
            executor(succeeding_spawner(0)),
        );
        let url = start(dispatcher, SourceFilter::disabled())?;

        let (status, body) = post(&url, "push", PUSH)?;

        assert_eq!(200, status);
        assert_eq!("No handlers file available.", body);

        Ok(())
    }

    #[test]
    fn it_should_fail_on_a_broken_rules_file() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let rules = dir.path().join("rules.toml");
        fs::write(&rules, "[[rule]\nrepo = ")?;
        let dispatcher = Dispatcher::new(
            Box::new(FileRuleSource::new(Some(rules))),
            executor(succeeding_spawner(0)),
        );
        let url = start(dispatcher, SourceFilter::disabled())?;

        assert_eq!(500, post(&url, "push", PUSH)?.0);

        Ok(())
    }

    #[test]
    fn it_should_forbid_callers_outside_the_allowed_networks() -> Result<(), Box<dyn Error>> {
        let dispatcher = Dispatcher::new(
            Box::new(StaticRuleSource(Some(vec![rule(None)]))),
            executor(succeeding_spawner(0)),
        );
        let sources = SourceFilter::from_config(&crate::config::SourceConfig {
            github_meta: false,
            allowed_networks: vec!["192.30.252.0/22".to_string()],
        })?;
        let url = start(dispatcher, sources)?;

        assert_eq!(403, post(&url, "push", PUSH)?.0);

        Ok(())
    }

    #[test]
    fn it_should_let_callers_in_the_allowed_networks() -> Result<(), Box<dyn Error>> {
        let dispatcher = Dispatcher::new(
            Box::new(StaticRuleSource(Some(vec![rule(None)]))),
            executor(succeeding_spawner(1)),
        );
        let sources = SourceFilter::from_config(&crate::config::SourceConfig {
            github_meta: false,
            allowed_networks: vec!["127.0.0.0/8".to_string()],
        })?;
        let url = start(dispatcher, sources)?;

        assert_eq!(200, post(&url, "push", PUSH)?.0);

        Ok(())
    }

    #[test]
    fn it_should_stop_when_unblocked() -> Result<(), Box<dyn Error>> {
        let dispatcher = Dispatcher::new(
            Box::new(StaticRuleSource(Some(vec![]))),
            executor(succeeding_spawner(0)),
        );
        let server = WebhookServer::bind(
            "127.0.0.1:0",
            dispatcher,
            SourceFilter::disabled(),
            Cancellation::new(),
        )?;
        let unblocker = server.unblocker();

        let serving = thread::spawn(move || server.serve());
        unblocker.unblock();

        assert!(serving.join().is_ok());

        Ok(())
    }
}
