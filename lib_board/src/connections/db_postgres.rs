//! # PostgreSQL Driver
//!
//! [`StoreDriver`] backed by a single `tokio-postgres` client. The connection
//! future runs on its own task; destroying a handle aborts that task, which
//! fails every statement still in flight on it.
//!
//! TLS is negotiated with `rustls` unless the URL says `sslmode=disable`.
//! Identifier parameters are bound as native `uuid` values, and `uuid`
//! columns come back in canonical string form.

use std::error::Error as StdError;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use rustls::{ClientConfig, RootCertStore};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_postgres::config::SslMode;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{Client, Config, NoTls, Row};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, error, info, warn};
use url::Url;

use super::statements::{Statement, StatementKind};
use super::store::{
    StoreDriver, StoreError, StoreErrorKind, StoreHandle, StoreOutcome, StoreRow, StoreValue,
};

#[derive(Clone)]
enum Transport {
    Plain,
    Rustls(MakeRustlsConnect),
}

pub struct PostgresDriver {
    config: Config,
    transport: Transport,
    display_url: String,
}

impl PostgresDriver {
    pub fn new(database_url: &str) -> Result<Self, StoreError> {
        let display_url = mask_url_password(database_url);
        let config: Config = database_url.parse().map_err(|e| {
            StoreError::new(
                StoreErrorKind::Other,
                format!("Invalid database url {}: {}", display_url, e),
            )
        })?;

        let transport = match config.get_ssl_mode() {
            SslMode::Disable => Transport::Plain,
            _ => Transport::Rustls(create_rustls_connector()?),
        };

        Ok(Self {
            config,
            transport,
            display_url,
        })
    }
}

impl StoreDriver for PostgresDriver {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn StoreHandle>, StoreError>> {
        async move {
            info!("Connecting to {}", self.display_url);
            let handle = match &self.transport {
                Transport::Plain => {
                    let (client, connection) =
                        self.config.connect(NoTls).await.map_err(map_pg_error)?;
                    PostgresHandle::spawn(client, connection)
                }
                Transport::Rustls(tls) => {
                    let (client, connection) =
                        self.config.connect(tls.clone()).await.map_err(map_pg_error)?;
                    PostgresHandle::spawn(client, connection)
                }
            };
            Ok(Arc::new(handle) as Arc<dyn StoreHandle>)
        }
        .boxed()
    }
}

struct PostgresHandle {
    client: RwLock<Option<Client>>,
    connection_task: Mutex<Option<JoinHandle<()>>>,
}

impl PostgresHandle {
    fn spawn<S, T>(client: Client, connection: tokio_postgres::Connection<S, T>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Postgres connection error: {}", e);
            }
        });
        Self {
            client: RwLock::new(Some(client)),
            connection_task: Mutex::new(Some(task)),
        }
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        self.connection_task
            .lock()
            .expect("Postgres task lock poisoned")
            .take()
    }
}

impl StoreHandle for PostgresHandle {
    fn run<'a>(
        &'a self,
        statement: &'a Statement,
        params: &'a [StoreValue],
    ) -> BoxFuture<'a, Result<StoreOutcome, StoreError>> {
        async move {
            let bound = bind_params(params)?;
            let refs: Vec<&(dyn ToSql + Sync)> = bound
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();

            let guard = self.client.read().await;
            let client = guard.as_ref().ok_or_else(|| {
                StoreError::new(StoreErrorKind::ConnectionLost, "Connection already closed")
            })?;

            match statement.kind {
                StatementKind::Query => {
                    let rows = client
                        .query(statement.sql, &refs)
                        .await
                        .map_err(map_pg_error)?;
                    Ok(StoreOutcome::with_rows(rows.iter().map(row_to_store_row).collect()))
                }
                StatementKind::Mutation => {
                    let affected = client
                        .execute(statement.sql, &refs)
                        .await
                        .map_err(map_pg_error)?;
                    Ok(StoreOutcome::affected(affected))
                }
            }
        }
        .boxed()
    }

    fn probe(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        async move {
            let guard = self.client.read().await;
            let client = guard.as_ref().ok_or_else(|| {
                StoreError::new(StoreErrorKind::ConnectionLost, "Connection already closed")
            })?;
            client
                .simple_query("SELECT 1")
                .await
                .map(|_| ())
                .map_err(map_pg_error)
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        async move {
            // Dropping the client lets the connection send Terminate and finish.
            drop(self.client.write().await.take());
            if let Some(task) = self.take_task() {
                task.await.map_err(|e| {
                    StoreError::new(StoreErrorKind::Other, format!("Connection task failed: {}", e))
                })?;
            }
            debug!("Postgres connection closed");
            Ok(())
        }
        .boxed()
    }

    fn destroy(&self) {
        if let Some(task) = self.take_task() {
            task.abort();
        }
        if let Ok(mut client) = self.client.try_write() {
            client.take();
        }
        warn!("Postgres connection destroyed");
    }
}

/// NULL that binds to a parameter of any type.
#[derive(Debug)]
struct SqlNull;

impl ToSql for SqlNull {
    fn to_sql(
        &self,
        _ty: &Type,
        _out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        Ok(IsNull::Yes)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Integers bind as BIGINT; statements cast where a narrower column needs it.
fn bind_params(params: &[StoreValue]) -> Result<Vec<Box<dyn ToSql + Sync + Send>>, StoreError> {
    params
        .iter()
        .map(|param| -> Result<Box<dyn ToSql + Sync + Send>, StoreError> {
            Ok(match param {
                StoreValue::Null => Box::new(SqlNull),
                StoreValue::Bool(value) => Box::new(*value),
                StoreValue::Int(value) => Box::new(*value),
                StoreValue::Text(value) => Box::new(value.clone()),
                StoreValue::Id(value) => Box::new(uuid::Uuid::parse_str(value).map_err(|e| {
                    StoreError::new(
                        StoreErrorKind::InvalidParameter,
                        format!("Invalid identifier '{}': {}", value, e),
                    )
                })?),
            })
        })
        .collect()
}

fn row_to_store_row(row: &Row) -> StoreRow {
    let mut out = Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_string(), column_value(row, idx, column.type_()));
    }
    out
}

fn column_value(row: &Row, idx: usize, ty: &Type) -> Value {
    let value: Result<Option<Value>, tokio_postgres::Error> = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx).map(|v| v.map(Value::from))
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx).map(|v| v.map(Value::from))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx).map(|v| v.map(Value::from))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx).map(|v| v.map(Value::from))
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx).map(|v| v.map(|f| Value::from(f64::from(f))))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx).map(|v| v.map(Value::from))
    } else if *ty == Type::UUID {
        row.try_get::<_, Option<uuid::Uuid>>(idx)
            .map(|v| v.map(|id| Value::from(id.hyphenated().to_string())))
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .map(|v| v.map(|ts| Value::from(ts.to_rfc3339())))
    } else if *ty == Type::TIMESTAMP {
        row.try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .map(|v| v.map(|ts| Value::from(ts.to_string())))
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        row.try_get::<_, Option<Value>>(idx)
    } else {
        row.try_get::<_, Option<String>>(idx).map(|v| v.map(Value::from))
    };

    match value {
        Ok(Some(value)) => value,
        Ok(None) => Value::Null,
        Err(e) => {
            debug!("Column {} of type {} not representable: {}", idx, ty, e);
            Value::Null
        }
    }
}

fn map_pg_error(e: tokio_postgres::Error) -> StoreError {
    if let Some(db) = e.as_db_error() {
        let message = match db.detail() {
            Some(detail) => format!("{} {}", db.message(), detail),
            None => db.message().to_string(),
        };
        let code = db.code();
        let kind = if *code == SqlState::UNIQUE_VIOLATION {
            StoreErrorKind::UniqueViolation
        } else if *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION
            && message.contains("no encryption")
        {
            StoreErrorKind::InsecureTransport
        } else if *code == SqlState::ADMIN_SHUTDOWN
            || *code == SqlState::CRASH_SHUTDOWN
            || *code == SqlState::CANNOT_CONNECT_NOW
        {
            StoreErrorKind::ConnectionLost
        } else {
            StoreErrorKind::Other
        };
        return StoreError::new(kind, message);
    }

    let message = e.to_string();
    let io_failure = e
        .source()
        .and_then(|source| source.downcast_ref::<std::io::Error>())
        .is_some();
    let kind = if e.is_closed() || io_failure {
        StoreErrorKind::ConnectionLost
    } else if message.contains("TLS") || message.contains("SSL") {
        StoreErrorKind::InsecureTransport
    } else {
        StoreErrorKind::Other
    };
    StoreError::new(kind, message)
}

/// Builds a rustls connector trusting the system store plus the webpki roots.
fn create_rustls_connector() -> Result<MakeRustlsConnect, StoreError> {
    let mut root_store = RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs();
    for error in native_certs.errors {
        warn!("Error loading a native certificate: {}", error);
    }
    for cert in native_certs.certs {
        if let Err(e) = root_store.add(cert) {
            warn!("Skipping unusable native certificate: {}", e);
        }
    }
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| StoreError::new(StoreErrorKind::InsecureTransport, e.to_string()))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    Ok(MakeRustlsConnect::new(config))
}

/// Replaces the password of a connection URL with `*****` for logging.
pub fn mask_url_password(database_url: &str) -> String {
    match Url::parse(database_url) {
        Ok(mut url) if url.password().is_some() => {
            if url.set_password(Some("*****")).is_ok() {
                url.to_string()
            } else {
                database_url.to_string()
            }
        }
        Ok(url) => url.to_string(),
        Err(_) => "<unparseable database url>".to_string(),
    }
}
