//! # Sessions
//!
//! A [`Session`] binds an opaque token to an identity and, once its client has
//! upgraded, to that client's live connection. The connection is held weakly:
//! the session never keeps a closed transport alive.

use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use http::HeaderMap;
use http::header::{AUTHORIZATION, COOKIE};
use tracing::{debug, info, warn};

use super::account::Account;
use super::cache::Shared;
use crate::websocket::connection::ConnectionHandle;
use crate::websocket::message::Message;

#[derive(Debug)]
pub struct Session {
    token: String,
    identity: Option<Shared<Account>>,
    connection: Mutex<Option<Weak<ConnectionHandle>>>,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(token: impl Into<String>, identity: Option<Shared<Account>>) -> Self {
        Self {
            token: token.into(),
            identity,
            connection: Mutex::new(None),
            created_at: Utc::now(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn identity(&self) -> Option<&Shared<Account>> {
        self.identity.as_ref()
    }

    pub fn account_id(&self) -> Option<String> {
        self.identity
            .as_ref()
            .map(|account| account.read().expect("Account lock poisoned").id.clone())
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Points this session at `connection`, replacing any earlier one.
    pub fn bind_connection(&self, connection: &Arc<ConnectionHandle>) {
        let mut slot = self.connection.lock().expect("Session connection lock poisoned");
        if let Some(previous) = slot.as_ref().and_then(Weak::upgrade) {
            if previous.id() != connection.id() && !previous.is_closed() {
                info!(
                    "Session rebinding from connection {} to {}",
                    previous.details(),
                    connection.details()
                );
            }
        }
        *slot = Some(Arc::downgrade(connection));
    }

    /// The bound connection, if it is still open.
    pub fn connection(&self) -> Option<Arc<ConnectionHandle>> {
        self.connection
            .lock()
            .expect("Session connection lock poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|connection| !connection.is_closed())
    }

    /// Clears the binding if it still refers to `connection`.
    pub fn release_connection(&self, connection: &ConnectionHandle) -> bool {
        let mut slot = self.connection.lock().expect("Session connection lock poisoned");
        let bound_here = slot
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|current| current.id() == connection.id());
        if bound_here {
            *slot = None;
        }
        bound_here
    }
}

/// Process-wide token → session map.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and stores a session under a fresh random token.
    pub fn create(&self, identity: Option<Shared<Account>>) -> Arc<Session> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let session = Arc::new(Session::new(token, identity));
        self.insert(Arc::clone(&session));
        session
    }

    pub fn insert(&self, session: Arc<Session>) {
        if self
            .sessions
            .insert(session.token().to_string(), session)
            .is_some()
        {
            warn!("Session token collision; previous session replaced");
        }
    }

    pub fn get(&self, token: &str) -> Option<Arc<Session>> {
        self.sessions.get(token).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, token: &str) -> Option<Arc<Session>> {
        self.sessions.remove(token).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn live_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.sessions
            .iter()
            .filter_map(|entry| entry.value().connection())
            .collect()
    }

    /// Writes `message` to every live upgraded session; returns how many took it.
    pub fn broadcast(&self, message: &Message) -> usize {
        let mut delivered = 0;
        for connection in self.live_connections() {
            match connection.write(message) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Broadcast to {} failed: {}", connection.details(), e),
            }
        }
        debug!("Broadcast {} to {} sessions", message.action, delivered);
        delivered
    }

    /// Removes every session and returns them.
    pub fn clear(&self) -> Vec<Arc<Session>> {
        let drained: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in &drained {
            self.sessions.remove(session.token());
        }
        drained
    }
}

/// Finds the session token in request headers.
///
/// A cookie named `cookie_name` wins; otherwise the raw value of the
/// `Authorization` header is used.
pub fn session_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let from_cookie = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == cookie_name && !value.is_empty()).then(|| value.to_string())
        });
    if from_cookie.is_some() {
        return from_cookie;
    }

    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}
