//! # Registry
//!
//! The explicitly owned service container: store manager, session table,
//! settings and the process shutdown signal. One is built at startup and
//! handed to the dispatcher; tests build their own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::session::SessionTable;
use crate::connections::manager::ConnectionManager;
use crate::websocket::codec::{DEFAULT_MAX_MESSAGE_LENGTH, FrameCodec};
use crate::websocket::message::{ControlAction, Message};

/// Settings the core needs at request time.
#[derive(Debug, Clone)]
pub struct BoardSettings {
    pub session_cookie_name: String,
    pub max_message_length: usize,
}

impl Default for BoardSettings {
    fn default() -> Self {
        Self {
            session_cookie_name: "LOGIN_SESSION_KEY".to_string(),
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
        }
    }
}

/// Why the process is going down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Requested(String),
    Fatal(String),
}

pub struct Registry {
    settings: BoardSettings,
    store: Arc<ConnectionManager>,
    sessions: SessionTable,
    shutdown: CancellationToken,
    shutting_down: AtomicBool,
    reason: Mutex<Option<ShutdownReason>>,
}

impl Registry {
    pub fn new(settings: BoardSettings, store: Arc<ConnectionManager>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            store,
            sessions: SessionTable::new(),
            shutdown: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
            reason: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &BoardSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<ConnectionManager> {
        &self.store
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.settings.max_message_length)
    }

    /// Cancelled once shutdown begins, for any reason.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().expect("Shutdown reason lock poisoned").clone()
    }

    /// Starts a shutdown. The first reason recorded wins.
    pub fn begin_shutdown(&self, reason: ShutdownReason) {
        {
            let mut slot = self.reason.lock().expect("Shutdown reason lock poisoned");
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.shutting_down.store(true, Ordering::Release);
        self.shutdown.cancel();
    }

    /// Brings the process down after an unrecovered failure.
    pub fn terminate(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!("Terminating: {}", reason);
        self.begin_shutdown(ShutdownReason::Fatal(reason));
    }

    /// Tells every live client to drop its local caches.
    pub fn clear_client_caches(&self) -> usize {
        let delivered = self
            .sessions
            .broadcast(&Message::control(ControlAction::ClearCache, Value::Null));
        info!("Cache clear sent to {} sessions", delivered);
        delivered
    }

    /// Closes every session connection and returns how many were open.
    pub fn close_all_connections(&self) -> usize {
        let connections = self.sessions.live_connections();
        for connection in &connections {
            connection.close();
        }
        connections.len()
    }

    /// Forgets all sessions and cached entities and reconnects to the store.
    pub async fn full_state_reset(&self) {
        let closed = self.close_all_connections();
        let sessions = self.sessions.clear().len();
        let cached = self.store.accounts().clear();
        info!(
            "Full state reset: {} sessions dropped, {} connections closed, {} cache keys dropped",
            sessions, closed, cached
        );
        self.store.request_reset().await;
    }
}
