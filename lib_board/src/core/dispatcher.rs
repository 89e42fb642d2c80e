//! # Request Dispatcher
//!
//! Routes an `(entity, action)` pair to the handler registered for it, after
//! deciding whether the caller may reach it at all.
//!
//! ## Core Design Principles:
//!
//! 1. **Registered, not discovered**: handlers are added through a
//!    [`DispatcherBuilder`] at startup. `build` fails fast on duplicate
//!    registrations or an access policy naming a handler that does not exist.
//! 2. **Explicit access policy**: an [`AccessPolicy`] lists the actions that
//!    need no session, optionally restricted to particular resource values.
//!    Everything else needs a live session token.
//! 3. **One failure boundary**: every error a handler returns is routed
//!    through [`Dispatcher::recover`], which reports it, resets the store, or
//!    brings the process down according to [`BoardError::disposition`].

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use axum::response::Response;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use http::{HeaderMap, StatusCode};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use super::registry::Registry;
use super::responder::{Reply, Responder};
use super::session::{Session, session_token};
use crate::error::{BoardError, Disposition};

pub type Params = Map<String, Value>;

pub type HandlerFuture = BoxFuture<'static, Result<Reply, BoardError>>;

type Handler = Arc<dyn Fn(HandlerRequest) -> HandlerFuture + Send + Sync>;

/// Everything a handler gets to see about one request.
pub struct HandlerRequest {
    pub registry: Arc<Registry>,
    pub session: Option<Arc<Session>>,
    pub headers: HeaderMap,
    pub params: Params,
    pub responder: Responder,
}

impl HandlerRequest {
    /// A required parameter as a string. Numbers and booleans are stringified.
    pub fn param(&self, name: &str) -> Result<String, BoardError> {
        self.optional_param(name)
            .ok_or_else(|| BoardError::MissingParameter(name.to_string()))
    }

    pub fn optional_param(&self, name: &str) -> Option<String> {
        param_text(&self.params, name)
    }

    /// The caller's session, or `Unauthorized`.
    pub fn require_session(&self) -> Result<&Arc<Session>, BoardError> {
        self.session.as_ref().ok_or(BoardError::Unauthorized)
    }
}

fn param_text(params: &Params, name: &str) -> Option<String> {
    match params.get(name)? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct ResourceRule {
    param: String,
    files: HashSet<String>,
    pattern: Option<Regex>,
}

impl ResourceRule {
    fn permits(&self, params: &Params) -> bool {
        let Some(value) = param_text(params, &self.param) else {
            return false;
        };
        self.files.contains(&value)
            || self
                .pattern
                .as_ref()
                .is_some_and(|pattern| pattern.is_match(&value))
    }
}

/// Which actions may be reached without a session.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    open: HashSet<(String, String)>,
    resources: HashMap<(String, String), ResourceRule>,
}

impl AccessPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens `entity`/`action` to everyone.
    pub fn allow(mut self, entity: &str, action: &str) -> Self {
        self.open.insert((entity.to_string(), action.to_string()));
        self
    }

    /// Opens `entity`/`action` only when parameter `param` names one of
    /// `files` or matches `pattern`.
    pub fn allow_resource<'a>(
        mut self,
        entity: &str,
        action: &str,
        param: &str,
        files: impl IntoIterator<Item = &'a str>,
        pattern: Option<&str>,
    ) -> Result<Self, BoardError> {
        let pattern = pattern
            .map(Regex::new)
            .transpose()
            .map_err(|e| BoardError::Unrecoverable(format!("bad resource pattern: {}", e)))?;
        self.resources.insert(
            (entity.to_string(), action.to_string()),
            ResourceRule {
                param: param.to_string(),
                files: files.into_iter().map(str::to_string).collect(),
                pattern,
            },
        );
        Ok(self)
    }

    pub fn permits(&self, entity: &str, action: &str, params: &Params) -> bool {
        let key = (entity.to_string(), action.to_string());
        if self.open.contains(&key) {
            return true;
        }
        self.resources
            .get(&key)
            .is_some_and(|rule| rule.permits(params))
    }

    fn entries(&self) -> impl Iterator<Item = &(String, String)> {
        self.open.iter().chain(self.resources.keys())
    }
}

#[derive(Default)]
pub struct DispatcherBuilder {
    handlers: HashMap<(String, String), Handler>,
    policy: AccessPolicy,
    problems: Vec<String>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for `entity`/`action`.
    pub fn register<F, Fut>(&mut self, entity: &str, action: &str, handler: F) -> &mut Self
    where
        F: Fn(HandlerRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, BoardError>> + Send + 'static,
    {
        if entity.is_empty() || action.is_empty() {
            self.problems
                .push(format!("empty handler name '{}/{}'", entity, action));
            return self;
        }
        let key = (entity.to_string(), action.to_string());
        if self.handlers.contains_key(&key) {
            self.problems
                .push(format!("duplicate handler for {}/{}", entity, action));
            return self;
        }
        let handler: Handler = Arc::new(move |request| handler(request).boxed());
        self.handlers.insert(key, handler);
        self
    }

    pub fn policy(&mut self, policy: AccessPolicy) -> &mut Self {
        self.policy = policy;
        self
    }

    pub fn build(self, registry: Arc<Registry>) -> Result<Dispatcher, BoardError> {
        let mut problems = self.problems;
        for (entity, action) in self.policy.entries() {
            if !self.handlers.contains_key(&(entity.clone(), action.clone())) {
                problems.push(format!(
                    "access policy names unregistered handler {}/{}",
                    entity, action
                ));
            }
        }
        if !problems.is_empty() {
            return Err(BoardError::Unrecoverable(problems.join("; ")));
        }

        let entities = self
            .handlers
            .keys()
            .map(|(entity, _)| entity.clone())
            .collect();
        info!("Dispatcher ready with {} handlers", self.handlers.len());
        Ok(Dispatcher {
            handlers: self.handlers,
            entities,
            policy: self.policy,
            registry,
        })
    }
}

/// # Dispatcher
///
/// Shared by every transport. [`Dispatcher::handle`] is the entry point: it
/// authorizes, runs the handler and delivers either the reply or the error
/// through the request's [`Responder`].
pub struct Dispatcher {
    handlers: HashMap<(String, String), Handler>,
    entities: HashSet<String>,
    policy: AccessPolicy,
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Decides whether the caller may proceed.
    ///
    /// A live session always qualifies. Without one, only actions opened by
    /// the access policy do; a bare upgrade (no entity) never does.
    pub fn authorize(
        &self,
        entity: Option<&str>,
        action: Option<&str>,
        headers: &HeaderMap,
        params: &Params,
    ) -> Result<Option<Arc<Session>>, BoardError> {
        let session = session_token(headers, &self.registry.settings().session_cookie_name)
            .and_then(|token| self.registry.sessions().get(&token));
        if session.is_some() {
            return Ok(session);
        }

        match (entity, action) {
            (Some(entity), Some(action)) if self.policy.permits(entity, action, params) => {
                Ok(None)
            }
            _ => Err(BoardError::Unauthorized),
        }
    }

    /// Authorizes and runs the handler for `entity`/`action`.
    pub async fn dispatch(
        &self,
        entity: &str,
        action: &str,
        headers: HeaderMap,
        params: Params,
        responder: Responder,
    ) -> Result<Reply, BoardError> {
        let session = self.authorize(Some(entity), Some(action), &headers, &params)?;

        if !self.entities.contains(entity) {
            return Err(BoardError::UnknownEntity(entity.to_string()));
        }
        let handler = self
            .handlers
            .get(&(entity.to_string(), action.to_string()))
            .ok_or_else(|| BoardError::UnknownAction {
                entity: entity.to_string(),
                action: action.to_string(),
            })?;

        debug!(entity, action, "Dispatching");
        let request = HandlerRequest {
            registry: Arc::clone(&self.registry),
            session,
            headers,
            params,
            responder,
        };
        match tokio::spawn(handler(request)).await {
            Ok(result) => result,
            Err(e) => Err(BoardError::Unrecoverable(format!(
                "{}/{} handler failed: {}",
                entity, action, e
            ))),
        }
    }

    /// Dispatches and delivers the outcome. Returns the HTTP response when
    /// the responder is HTTP.
    pub async fn handle(
        &self,
        entity: &str,
        action: &str,
        headers: HeaderMap,
        params: Params,
        responder: Responder,
    ) -> Option<Response> {
        match self
            .dispatch(entity, action, headers, params, responder.clone())
            .await
        {
            Ok(reply) => responder.respond(reply),
            Err(e) => self.recover(e, &responder),
        }
    }

    /// Turns a failure into whatever its disposition calls for.
    pub fn recover(&self, err: BoardError, responder: &Responder) -> Option<Response> {
        match err.disposition() {
            Disposition::Report(status) => {
                if status.is_server_error() {
                    warn!("Request failed with {}: {}", status, err);
                } else {
                    debug!("Request rejected with {}: {}", status, err);
                }
                responder.report_error(&err.to_string(), status)
            }
            Disposition::ResetStore => {
                warn!("Store fault, requesting reset: {}", err);
                let store = Arc::clone(self.registry.store());
                tokio::spawn(async move { store.request_reset().await });
                responder.report_error(&err.to_string(), StatusCode::SERVICE_UNAVAILABLE)
            }
            Disposition::Terminate => {
                error!("Unrecoverable failure: {}", err);
                self.registry.terminate(err.to_string());
                responder.report_error("Internal server error", StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}
