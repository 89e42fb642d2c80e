//! In-memory store and a fully wired board for handler tests.

use std::path::Path;
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use http::header::AUTHORIZATION;
use http::{HeaderMap, HeaderValue};
use lib_board::BoardError;
use lib_board::connections::{
    ConnectionManager, Statement, StoreDriver, StoreError, StoreErrorKind, StoreHandle,
    StoreOutcome, StoreRow, StoreTimings, StoreValue,
};
use lib_board::core::{BoardSettings, Dispatcher, Params, Registry, Reply, ReplyBody, Responder};
use serde_json::{Value, json};

use super::{accounts, build_dispatcher, statement_catalog};

/// The `account` table, enough of it for the account statements.
#[derive(Default)]
pub struct AccountTable {
    rows: Mutex<Vec<StoreRow>>,
}

fn column<'r>(row: &'r StoreRow, name: &str) -> &'r str {
    row.get(name).and_then(Value::as_str).unwrap_or_default()
}

impl AccountTable {
    pub fn validation_token(&self, id: &str) -> Option<String> {
        self.find(id, "validation_token")
    }

    pub fn password_hash(&self, id: &str) -> Option<String> {
        self.find(id, "password_hash")
    }

    fn find(&self, id: &str, name: &str) -> Option<String> {
        let rows = self.rows.lock().unwrap();
        rows.iter()
            .find(|row| column(row, "uuid") == id)
            .map(|row| column(row, name).to_string())
    }

    fn apply(&self, name: &str, params: &[StoreValue]) -> Result<StoreOutcome, StoreError> {
        let text = |i: usize| match params.get(i) {
            Some(StoreValue::Text(value)) | Some(StoreValue::Id(value)) => value.clone(),
            _ => String::new(),
        };
        let mut rows = self.rows.lock().unwrap();

        match name {
            accounts::CREATE => {
                let email = text(3);
                if rows
                    .iter()
                    .any(|row| column(row, "email").eq_ignore_ascii_case(&email))
                {
                    return Err(StoreError::new(
                        StoreErrorKind::UniqueViolation,
                        format!(
                            "duplicate key value violates unique constraint \"account_email_key\" \
                             Key (email)=({}) already exists.",
                            email
                        ),
                    ));
                }
                let row = json!({
                    "uuid": text(0),
                    "first_name": text(1),
                    "last_name": text(2),
                    "email": email,
                    "password_hash": text(4),
                    "validation_token": text(5),
                    "validated": false,
                    "notification_flags": 0,
                });
                rows.push(row.as_object().cloned().unwrap_or_default());
                Ok(StoreOutcome::affected(1))
            }
            accounts::LOOKUP_BY_EMAIL => Ok(StoreOutcome::with_rows(
                rows.iter()
                    .filter(|row| column(row, "email").to_lowercase() == text(0))
                    .cloned()
                    .collect(),
            )),
            accounts::LOOKUP_UNVALIDATED => Ok(StoreOutcome::with_rows(
                rows.iter()
                    .filter(|row| {
                        column(row, "email").to_lowercase() == text(0)
                            && column(row, "validation_token") == text(1)
                    })
                    .map(|row| {
                        let mut found = StoreRow::new();
                        found.insert("uuid".into(), row["uuid"].clone());
                        found.insert("validated".into(), row["validated"].clone());
                        found
                    })
                    .collect(),
            )),
            accounts::VALIDATE => {
                let mut affected = 0;
                for row in rows.iter_mut().filter(|row| {
                    column(row, "uuid") == text(0) && row["validated"] == json!(false)
                }) {
                    row.insert("validated".into(), json!(true));
                    affected += 1;
                }
                Ok(StoreOutcome::affected(affected))
            }
            accounts::CHANGE_PASSWORD => {
                let mut affected = 0;
                for row in rows.iter_mut().filter(|row| column(row, "uuid") == text(1)) {
                    row.insert("password_hash".into(), json!(text(0)));
                    affected += 1;
                }
                Ok(StoreOutcome::affected(affected))
            }
            other => Err(StoreError::new(
                StoreErrorKind::Other,
                format!("unknown statement {}", other),
            )),
        }
    }
}

struct MemoryHandle {
    table: Arc<AccountTable>,
}

impl StoreHandle for MemoryHandle {
    fn run<'a>(
        &'a self,
        statement: &'a Statement,
        params: &'a [StoreValue],
    ) -> BoxFuture<'a, Result<StoreOutcome, StoreError>> {
        let result = self.table.apply(statement.name, params);
        async move { result }.boxed()
    }

    fn probe(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        async { Ok(()) }.boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        async { Ok(()) }.boxed()
    }

    fn destroy(&self) {}
}

struct MemoryDriver {
    table: Arc<AccountTable>,
}

impl StoreDriver for MemoryDriver {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn StoreHandle>, StoreError>> {
        let handle = Arc::new(MemoryHandle {
            table: Arc::clone(&self.table),
        });
        async move { Ok(handle as Arc<dyn StoreHandle>) }.boxed()
    }
}

fn registry_with(table: Arc<AccountTable>) -> Arc<Registry> {
    let store = ConnectionManager::new(
        Arc::new(MemoryDriver { table }),
        statement_catalog().unwrap(),
        StoreTimings::default(),
    );
    Registry::new(BoardSettings::default(), store)
}

/// A registry over an empty table, not yet connected.
pub fn registry() -> Arc<Registry> {
    registry_with(Arc::default())
}

pub fn params(value: Value) -> Params {
    value.as_object().cloned().unwrap_or_default()
}

pub struct Board {
    pub registry: Arc<Registry>,
    pub dispatcher: Dispatcher,
    pub table: Arc<AccountTable>,
}

impl Board {
    pub async fn connected() -> Self {
        Self::with_resources(Path::new(".")).await
    }

    pub async fn with_resources(resource_dir: &Path) -> Self {
        let table = Arc::new(AccountTable::default());
        let registry = registry_with(Arc::clone(&table));
        registry.store().request_connect().await;
        let dispatcher =
            build_dispatcher(Arc::clone(&registry), resource_dir.to_path_buf()).unwrap();
        Self {
            registry,
            dispatcher,
            table,
        }
    }

    /// Headers carrying a fresh anonymous session token.
    pub fn session_headers(&self) -> HeaderMap {
        let session = self.registry.sessions().create(None);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(session.token()).unwrap());
        headers
    }

    pub async fn reply(
        &self,
        entity: &str,
        action: &str,
        headers: HeaderMap,
        params: Params,
    ) -> Result<Reply, BoardError> {
        let responder = Responder::for_http(&headers);
        self.dispatcher
            .dispatch(entity, action, headers, params, responder)
            .await
    }

    /// The JSON result of a dispatched call.
    pub async fn call(
        &self,
        entity: &str,
        action: &str,
        headers: HeaderMap,
        params: Params,
    ) -> Result<Value, BoardError> {
        let reply = self.reply(entity, action, headers, params).await?;
        Ok(match reply.body() {
            ReplyBody::Json(value) => value.clone(),
            _ => Value::Null,
        })
    }
}
