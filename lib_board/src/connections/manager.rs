//! # Store Connection Manager
//!
//! Owns the process's single physical connection to the backing store and the
//! account cache that sits in front of it.
//!
//! ## Lifecycle
//!
//! `Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected`
//!
//! - **`request_connect`**: only acts from `Disconnected`. A failed or timed-out
//!   attempt falls back to `Disconnected` and schedules one retry after the
//!   connect timeout (fixed backoff).
//! - **`request_reset`**: destroys the live handle and reconnects. Mid-transition
//!   requests are deferred by the same interval.
//! - **`request_shutdown`**: graceful close from `Connected` only.
//! - **`keepalive`**: bounded probe; any failure resets the connection.
//!
//! State lives behind a plain mutex that is never held across an await, and
//! every transition is published on a broadcast channel.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use http::StatusCode;
use regex::Regex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::statements::StatementCatalog;
use super::store::{
    StoreDriver, StoreError, StoreErrorKind, StoreHandle, StoreOutcome, StoreRow, StoreValue,
};
use crate::core::account::Account;
use crate::core::cache::{CacheKeys, EntityCache, Shared};
use crate::error::{BoardError, TransientFault};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreState::Disconnected => "Disconnected",
            StoreState::Connecting => "Connecting",
            StoreState::Connected => "Connected",
            StoreState::Disconnecting => "Disconnecting",
        };
        f.write_str(name)
    }
}

/// Time bounds applied by the manager.
#[derive(Debug, Clone, Copy)]
pub struct StoreTimings {
    /// Bound on one connect attempt; also the retry delay.
    pub connect_timeout: Duration,
    /// Bound on one keepalive probe.
    pub keepalive_timeout: Duration,
}

impl Default for StoreTimings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            keepalive_timeout: Duration::from_secs(30),
        }
    }
}

type ConnectCallback = Arc<dyn Fn() + Send + Sync>;

struct Inner {
    state: StoreState,
    handle: Option<Arc<dyn StoreHandle>>,
}

enum FollowUp {
    Connect,
    Retry,
    Nothing,
}

pub struct ConnectionManager {
    driver: Arc<dyn StoreDriver>,
    catalog: StatementCatalog,
    timings: StoreTimings,
    inner: Mutex<Inner>,
    transitions: broadcast::Sender<StoreState>,
    on_connect: Mutex<Option<ConnectCallback>>,
    pending_retries: AtomicUsize,
    accounts: EntityCache<Account>,
}

impl ConnectionManager {
    pub fn new(
        driver: Arc<dyn StoreDriver>,
        catalog: StatementCatalog,
        timings: StoreTimings,
    ) -> Arc<Self> {
        let (transitions, _) = broadcast::channel(64);
        Arc::new(Self {
            driver,
            catalog,
            timings,
            inner: Mutex::new(Inner {
                state: StoreState::Disconnected,
                handle: None,
            }),
            transitions,
            on_connect: Mutex::new(None),
            pending_retries: AtomicUsize::new(0),
            accounts: EntityCache::new(),
        })
    }

    pub fn state(&self) -> StoreState {
        self.lock_inner().state
    }

    /// Receives every state the manager moves into from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreState> {
        self.transitions.subscribe()
    }

    /// Registers the callback fired after each successful connect.
    pub fn set_on_connect<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_connect.lock().expect("Store callback lock poisoned") = Some(Arc::new(callback));
    }

    /// Connect attempts currently waiting on their retry delay.
    pub fn pending_retries(&self) -> usize {
        self.pending_retries.load(Ordering::SeqCst)
    }

    pub fn accounts(&self) -> &EntityCache<Account> {
        &self.accounts
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("Store state lock poisoned")
    }

    fn transition(&self, inner: &mut Inner, next: StoreState) {
        if inner.state == next {
            warn!("BUG: Redundant state transition to {}", next);
        }
        info!("Store connection: {} -> {}", inner.state, next);
        inner.state = next;
        // Nobody listening is fine.
        let _ = self.transitions.send(next);
    }

    pub fn request_connect(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let this = Arc::clone(self);
        async move {
            let follow_up = {
                let mut inner = this.lock_inner();
                match inner.state {
                    StoreState::Disconnected => {
                        this.transition(&mut inner, StoreState::Connecting);
                        FollowUp::Connect
                    }
                    StoreState::Disconnecting => {
                        info!(
                            "Connect requested while Disconnecting; retrying in {:?}",
                            this.timings.connect_timeout
                        );
                        FollowUp::Retry
                    }
                    state => {
                        warn!("Connect requested while {}; discarding", state);
                        FollowUp::Nothing
                    }
                }
            };

            match follow_up {
                FollowUp::Connect => this.connect().await,
                FollowUp::Retry => this.schedule_connect(),
                FollowUp::Nothing => {}
            }
        }
        .boxed()
    }

    async fn connect(self: &Arc<Self>) {
        let connected = timeout(self.timings.connect_timeout, self.driver.connect())
            .await
            .unwrap_or_else(|_| {
                Err(StoreError::new(
                    StoreErrorKind::Timeout,
                    format!("no connection within {:?}", self.timings.connect_timeout),
                ))
            });
        let handle = match connected {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Store connect failed ({:?}): {}", e.kind, e);
                return self.connect_failed();
            }
        };

        {
            let mut inner = self.lock_inner();
            inner.handle = Some(handle);
            self.transition(&mut inner, StoreState::Connected);
        }

        let callback = self
            .on_connect
            .lock()
            .expect("Store callback lock poisoned")
            .clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn connect_failed(self: &Arc<Self>) {
        {
            let mut inner = self.lock_inner();
            self.transition(&mut inner, StoreState::Disconnected);
        }
        self.schedule_connect();
    }

    fn schedule_connect(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let delay = self.timings.connect_timeout;
        self.pending_retries.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            sleep(delay).await;
            this.pending_retries.fetch_sub(1, Ordering::SeqCst);
            this.request_connect().await;
        });
    }

    pub fn request_reset(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let this = Arc::clone(self);
        async move {
            let follow_up = {
                let mut inner = this.lock_inner();
                match inner.state {
                    StoreState::Connected => {
                        match inner.handle.take() {
                            Some(handle) => handle.destroy(),
                            None => error!("BUG: Connected without a handle during reset"),
                        }
                        this.transition(&mut inner, StoreState::Disconnected);
                        FollowUp::Connect
                    }
                    StoreState::Disconnected => {
                        warn!("Reset requested while already Disconnected");
                        FollowUp::Connect
                    }
                    state => {
                        warn!(
                            "Reset requested while {}; retrying in {:?}",
                            state, this.timings.connect_timeout
                        );
                        FollowUp::Retry
                    }
                }
            };

            match follow_up {
                FollowUp::Connect => this.request_connect().await,
                FollowUp::Retry => this.schedule_connect(),
                FollowUp::Nothing => {}
            }
        }
        .boxed()
    }

    pub async fn request_shutdown(&self) {
        let handle = {
            let mut inner = self.lock_inner();
            match inner.state {
                StoreState::Connected => match inner.handle.take() {
                    Some(handle) => {
                        self.transition(&mut inner, StoreState::Disconnecting);
                        handle
                    }
                    None => {
                        error!("BUG: Connected without a handle during shutdown");
                        self.transition(&mut inner, StoreState::Disconnected);
                        return;
                    }
                },
                StoreState::Disconnected => {
                    warn!("Shutdown requested while already Disconnected");
                    return;
                }
                state => {
                    error!("BUG: Shutdown requested while {}; not proceeding", state);
                    return;
                }
            }
        };

        if let Err(e) = handle.close().await {
            warn!("Graceful store close failed: {}", e);
        }

        let mut inner = self.lock_inner();
        self.transition(&mut inner, StoreState::Disconnected);
    }

    pub async fn keepalive(self: &Arc<Self>) {
        let handle = {
            let inner = self.lock_inner();
            match (inner.state, &inner.handle) {
                (StoreState::Connected, Some(handle)) => Arc::clone(handle),
                (StoreState::Connected, None) => {
                    error!("BUG: Connected without a handle during keepalive");
                    return;
                }
                (state, _) => {
                    warn!("Keepalive skipped while {}", state);
                    return;
                }
            }
        };

        let failure = match timeout(self.timings.keepalive_timeout, handle.probe()).await {
            Ok(Ok(())) => {
                debug!("Store keepalive ok");
                return;
            }
            Ok(Err(e)) => e,
            Err(_) => StoreError::new(
                StoreErrorKind::Timeout,
                format!("no answer within {:?}", self.timings.keepalive_timeout),
            ),
        };

        let still_current = self
            .lock_inner()
            .handle
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &handle));
        if still_current {
            warn!("Store keepalive failed: {}; resetting", failure);
            self.request_reset().await;
        } else {
            debug!("Ignoring keepalive failure on a replaced handle: {}", failure);
        }
    }

    /// Runs `keepalive` every `every` until `stop` is cancelled.
    pub fn spawn_keepalive(self: &Arc<Self>, every: Duration, stop: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.keepalive().await,
                    _ = stop.cancelled() => {
                        debug!("Keepalive loop stopped");
                        break;
                    }
                }
            }
        })
    }

    fn connection_check(&self) -> Result<Arc<dyn StoreHandle>, BoardError> {
        let inner = self.lock_inner();
        match (inner.state, &inner.handle) {
            (StoreState::Connected, Some(handle)) => Ok(Arc::clone(handle)),
            (StoreState::Connected, None) => {
                error!("BUG: store is Connected but holds no handle");
                Err(BoardError::MissingHandle)
            }
            (state, _) => Err(BoardError::NotConnected(state)),
        }
    }

    /// Runs the statement registered as `op`.
    pub async fn execute(&self, op: &str, params: &[StoreValue]) -> Result<StoreOutcome, BoardError> {
        let statement = self.catalog.get(op).ok_or_else(|| {
            BoardError::Unrecoverable(format!("no statement registered as '{}'", op))
        })?;
        let handle = self.connection_check()?;
        debug!(op, params = params.len(), "Executing store operation");
        handle
            .run(statement, params)
            .await
            .map_err(|e| classify_store_error(op, e))
    }

    /// Runs `op` and converts its outcome with `extract`.
    pub async fn execute_with<T, F>(
        &self,
        op: &str,
        params: &[StoreValue],
        extract: F,
    ) -> Result<T, BoardError>
    where
        F: FnOnce(StoreOutcome) -> Result<T, BoardError>,
    {
        let outcome = self.execute(op, params).await?;
        extract(outcome)
    }

    /// Runs a mutation that must touch exactly one row, or none if `noop_ok`.
    pub async fn mutate_one_row(
        &self,
        op: &str,
        params: &[StoreValue],
        noop_ok: bool,
    ) -> Result<(), BoardError> {
        self.execute_with(op, params, |outcome| match outcome.affected_rows {
            1 => Ok(()),
            0 if noop_ok => Ok(()),
            0 => Err(BoardError::rejected(
                format!("{} did not match any record", op),
                StatusCode::NOT_FOUND,
            )),
            n => Err(BoardError::Integrity(format!(
                "{} changed {} rows, expected one",
                op, n
            ))),
        })
        .await
    }

    /// Cache-first lookup. On a miss the store is queried, the entity built
    /// by `build` is cached under all of its keys, and the shared instance is
    /// returned.
    pub async fn cached_lookup<E, F>(
        &self,
        cache: &EntityCache<E>,
        key: &str,
        op: &str,
        params: &[StoreValue],
        build: F,
    ) -> Result<Option<Shared<E>>, BoardError>
    where
        E: CacheKeys,
        F: FnOnce(StoreOutcome) -> Result<Option<E>, BoardError>,
    {
        if let Some(hit) = cache.get(key) {
            debug!("Cache hit for {}", key);
            return Ok(Some(hit));
        }

        debug!("Cache miss for {}; loading with {}", key, op);
        let outcome = self.execute(op, params).await?;
        Ok(build(outcome)?.map(|entity| cache.insert(entity)))
    }

    /// Account lookup through the account cache. `op` must return at most one row.
    pub async fn lookup_account(
        &self,
        key: &str,
        op: &str,
        params: &[StoreValue],
    ) -> Result<Option<Shared<Account>>, BoardError> {
        self.cached_lookup(&self.accounts, key, op, params, |outcome| {
            single_row(outcome, op)?
                .map(|row| Account::from_row(&row))
                .transpose()
        })
        .await
    }
}

/// Zero or one row; more than one is an integrity failure.
pub fn single_row(outcome: StoreOutcome, what: &str) -> Result<Option<StoreRow>, BoardError> {
    let count = outcome.rows.len();
    if count > 1 {
        error!("{} returned {} rows for a single-record lookup", what, count);
        return Err(BoardError::Integrity(format!(
            "multiple records ({}) returned by {}",
            count, what
        )));
    }
    Ok(outcome.rows.into_iter().next())
}

fn classify_store_error(op: &str, e: StoreError) -> BoardError {
    match e.kind {
        StoreErrorKind::UniqueViolation => {
            let id = extract_duplicate_identifier(&e.message).unwrap_or_else(|| {
                warn!("Could not find the duplicate identifier in: {}", e.message);
                "(unknown)".to_string()
            });
            info!("{} rejected duplicate identifier {}", op, id);
            BoardError::DuplicateIdentifier(id)
        }
        StoreErrorKind::ConnectionLost => BoardError::BackingStoreUnavailable {
            message: e.message,
            fault: Some(TransientFault::ConnectionLost),
        },
        StoreErrorKind::InsecureTransport => BoardError::BackingStoreUnavailable {
            message: e.message,
            fault: Some(TransientFault::InsecureTransport),
        },
        StoreErrorKind::InvalidParameter => {
            debug!("{} refused a parameter: {}", op, e.message);
            BoardError::bad_request(e.message)
        }
        StoreErrorKind::Timeout | StoreErrorKind::Other => {
            warn!("{} failed: {}", op, e.message);
            BoardError::BackingStoreUnavailable {
                message: e.message,
                fault: None,
            }
        }
    }
}

static POSTGRES_DUPLICATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Key \([^)]*\)=\((?P<value>[^)]*)\) already exists").expect("valid regex")
});

static MYSQL_DUPLICATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Duplicate entry '(?P<value>(?:[^'\\]|\\.)*)'").expect("valid regex")
});

/// Finds the offending value in a unique-violation message.
///
/// Understands the Postgres detail form and the MySQL form; a MySQL value that
/// is an escaped 16-byte binary identifier is returned in canonical UUID form.
pub fn extract_duplicate_identifier(raw: &str) -> Option<String> {
    if let Some(caps) = POSTGRES_DUPLICATE.captures(raw) {
        return Some(caps["value"].to_string());
    }
    let caps = MYSQL_DUPLICATE.captures(raw)?;
    let value = &caps["value"];
    if uuid::Uuid::parse_str(value).is_ok() {
        return Some(value.to_string());
    }
    Some(escaped_binary_to_uuid(value).unwrap_or_else(|| value.to_string()))
}

/// Decodes a SQL-escaped binary literal (`\xNN`, `\0`, `\\` and raw bytes)
/// holding exactly 16 bytes into a hyphenated UUID.
pub fn escaped_binary_to_uuid(escaped: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(16);
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        let byte = if c == '\\' {
            match chars.next()? {
                'x' => {
                    let hex: String = [chars.next()?, chars.next()?].iter().collect();
                    u8::from_str_radix(&hex, 16).ok()?
                }
                '0' => 0x00,
                'b' => 0x08,
                'n' => b'\n',
                'r' => b'\r',
                't' => b'\t',
                'Z' => 0x1a,
                other => u8::try_from(u32::from(other)).ok()?,
            }
        } else {
            u8::try_from(u32::from(c)).ok()?
        };
        bytes.push(byte);
    }
    let id = uuid::Uuid::from_slice(&bytes).ok()?;
    Some(id.hyphenated().to_string())
}
