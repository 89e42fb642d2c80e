//! # Account Handlers
//!
//! Sign-up, validation, login/logout and password changes. Account rows are
//! read through the shared account cache, so every session bound to an
//! account sees the same instance.

use std::sync::Arc;

use http::header::SET_COOKIE;
use http::{HeaderValue, StatusCode};
use lib_board::BoardError;
use lib_board::connections::manager::single_row;
use lib_board::connections::{Statement, StoreValue};
use lib_board::core::{AccessPolicy, Account, DispatcherBuilder, HandlerRequest, Reply, Shared};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

pub const ENTITY: &str = "Account";

pub const CREATE: &str = "account_create";
pub const LOOKUP_BY_EMAIL: &str = "account_lookup_by_email";
pub const LOOKUP_UNVALIDATED: &str = "account_lookup_unvalidated";
pub const VALIDATE: &str = "account_validate";
pub const CHANGE_PASSWORD: &str = "account_change_password";

const MIN_PASSWORD_LENGTH: usize = 8;

pub fn statements() -> Vec<Statement> {
    vec![
        Statement::mutation(
            CREATE,
            "INSERT INTO account (uuid, first_name, last_name, email, password_hash, \
             validation_token, validated, notification_flags, created, modified) \
             VALUES ($1, $2, $3, $4, $5, $6, false, 0, now(), now())",
        ),
        Statement::query(
            LOOKUP_BY_EMAIL,
            "SELECT uuid, email, first_name, last_name, password_hash, validated, \
             notification_flags, created AS creation_date, modified AS modification_date \
             FROM account WHERE lower(email) = $1 AND deleted IS NULL",
        ),
        Statement::query(
            LOOKUP_UNVALIDATED,
            "SELECT uuid, validated FROM account \
             WHERE lower(email) = $1 AND validation_token = $2 AND deleted IS NULL",
        ),
        Statement::mutation(
            VALIDATE,
            "UPDATE account SET validated = true, modified = now() \
             WHERE uuid = $1 AND NOT validated",
        ),
        Statement::mutation(
            CHANGE_PASSWORD,
            "UPDATE account SET password_hash = $1, modified = now() WHERE uuid = $2",
        ),
    ]
}

/// Opens the actions a caller needs before having a session.
pub fn policy(policy: AccessPolicy) -> AccessPolicy {
    policy
        .allow(ENTITY, "SignUp")
        .allow(ENTITY, "Login")
        .allow(ENTITY, "Validate")
}

pub fn register(builder: &mut DispatcherBuilder) {
    builder
        .register(ENTITY, "SignUp", sign_up)
        .register(ENTITY, "Validate", validate)
        .register(ENTITY, "Login", login)
        .register(ENTITY, "Logout", logout)
        .register(ENTITY, "ChangePassword", change_password);
}

/// `salt$sha256(salt:password)` in hex.
pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    format!("{}${}", salt, salted_digest(&salt, password))
}

pub fn verify_password(stored: &str, password: &str) -> bool {
    match stored.split_once('$') {
        Some((salt, digest)) => salted_digest(salt, password) == digest,
        None => false,
    }
}

fn salted_digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn check_new_password(password: &str) -> Result<(), BoardError> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(BoardError::bad_request(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }
    Ok(())
}

fn invalid_credentials() -> BoardError {
    BoardError::rejected("Invalid email or password", StatusCode::UNAUTHORIZED)
}

async fn sign_up(request: HandlerRequest) -> Result<Reply, BoardError> {
    let email = request.param("Email")?;
    let first_name = request.param("FirstName")?;
    let last_name = request.param("LastName")?;
    let password = request.param("Password")?;

    let email = email.trim().to_string();
    if !email.contains('@') {
        return Err(BoardError::bad_request(format!("Invalid email address: {}", email)));
    }
    check_new_password(&password)?;

    let id = Uuid::new_v4().to_string();
    let token = Uuid::new_v4().simple().to_string();
    request
        .registry
        .store()
        .mutate_one_row(
            CREATE,
            &[
                StoreValue::Id(id.clone()),
                StoreValue::from(first_name),
                StoreValue::from(last_name),
                StoreValue::from(email.as_str()),
                StoreValue::from(hash_password(&password)),
                StoreValue::from(token.as_str()),
            ],
            false,
        )
        .await?;

    info!(
        "Account {} created for {}; validate with /{}/Validate?Email={}&ValidationToken={}",
        id, email, ENTITY, email, token
    );
    Ok(Reply::json(json!({ "UUID": id })).with_status(StatusCode::CREATED))
}

async fn validate(request: HandlerRequest) -> Result<Reply, BoardError> {
    let email = request.param("Email")?;
    let token = request.param("ValidationToken")?;
    let store = request.registry.store();

    let row = store
        .execute_with(
            LOOKUP_UNVALIDATED,
            &[
                StoreValue::from(Account::email_key(&email)),
                StoreValue::from(token.as_str()),
            ],
            |outcome| single_row(outcome, LOOKUP_UNVALIDATED),
        )
        .await?
        .ok_or_else(|| {
            BoardError::rejected(
                format!("No account with address {} and token {}", email, token),
                StatusCode::NOT_FOUND,
            )
        })?;

    if row.get("validated").and_then(Value::as_bool).unwrap_or(false) {
        return Err(BoardError::bad_request(format!(
            "Account already validated: {}",
            email
        )));
    }
    let id = row
        .get("uuid")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BoardError::Integrity(format!("{} row without uuid", LOOKUP_UNVALIDATED)))?;

    store
        .mutate_one_row(VALIDATE, &[StoreValue::Id(id.clone())], false)
        .await?;
    store.accounts().update(&id, |account| account.validated = true);

    info!("Account {} ({}) has been validated", id, email);
    Ok(Reply::json(json!({ "UUID": id, "Validated": true })))
}

async fn login(request: HandlerRequest) -> Result<Reply, BoardError> {
    let email = request.param("Email")?;
    let password = request.param("Password")?;
    let key = Account::email_key(&email);

    let account: Shared<Account> = request
        .registry
        .store()
        .lookup_account(&key, LOOKUP_BY_EMAIL, &[StoreValue::from(key.as_str())])
        .await?
        .ok_or_else(invalid_credentials)?;

    let (matches, validated, view) = {
        let account = account.read().expect("Account lock poisoned");
        (
            verify_password(&account.password_hash, &password),
            account.validated,
            account.public_view(),
        )
    };
    if !matches {
        return Err(invalid_credentials());
    }
    if !validated {
        return Err(BoardError::rejected(
            "Account has not been validated",
            StatusCode::FORBIDDEN,
        ));
    }

    let session = request.registry.sessions().create(Some(Arc::clone(&account)));
    let cookie_name = &request.registry.settings().session_cookie_name;
    let cookie = format!(
        "{}={}; Path=/; HttpOnly; Secure; SameSite=Lax",
        cookie_name,
        session.token()
    );
    info!("Login for {}", key);

    let reply = Reply::json(json!({ "SessionKey": session.token(), "Account": view }));
    Ok(match HeaderValue::from_str(&cookie) {
        Ok(value) => reply.with_header(SET_COOKIE, value),
        Err(_) => {
            warn!("Session cookie name {:?} is not a valid header value", cookie_name);
            reply
        }
    })
}

async fn logout(request: HandlerRequest) -> Result<Reply, BoardError> {
    let session = request.require_session()?;
    request.registry.sessions().remove(session.token());
    info!("Logout for {:?}", session.account_id());

    let cookie = format!(
        "{}=; Path=/; Max-Age=0",
        request.registry.settings().session_cookie_name
    );
    let reply = Reply::json(json!({}));
    Ok(match HeaderValue::from_str(&cookie) {
        Ok(value) => reply.with_header(SET_COOKIE, value),
        Err(_) => reply,
    })
}

async fn change_password(request: HandlerRequest) -> Result<Reply, BoardError> {
    let session = request.require_session()?;
    let account = session.identity().cloned().ok_or(BoardError::Unauthorized)?;
    let current = request.param("Password")?;
    let new_password = request.param("NewPassword")?;
    check_new_password(&new_password)?;

    let (id, matches) = {
        let account = account.read().expect("Account lock poisoned");
        (
            account.id.clone(),
            verify_password(&account.password_hash, &current),
        )
    };
    if !matches {
        return Err(invalid_credentials());
    }

    let hash = hash_password(&new_password);
    request
        .registry
        .store()
        .mutate_one_row(
            CHANGE_PASSWORD,
            &[StoreValue::from(hash.as_str()), StoreValue::Id(id.clone())],
            false,
        )
        .await?;
    account.write().expect("Account lock poisoned").password_hash = hash;

    info!("Password changed for account {}", id);
    Ok(Reply::json(json!({ "UUID": id })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board_logic::testing::{Board, params};
    use lib_board::core::Responder;
    use http::HeaderMap;
    use http::header::AUTHORIZATION;

    #[test]
    fn test_password_hash_round_trip() {
        let stored = hash_password("correct horse");
        assert!(verify_password(&stored, "correct horse"));
        assert!(!verify_password(&stored, "wrong horse"));
        assert!(!verify_password("no-salt", "correct horse"));
        assert_ne!(stored, hash_password("correct horse"));
    }

    #[test]
    fn test_statements_are_unique() {
        let catalog = lib_board::connections::StatementCatalog::from_statements(statements());
        assert_eq!(catalog.unwrap().len(), 5);
    }

    async fn sign_up_and_validate(board: &Board, email: &str) -> String {
        let reply = board
            .call(
                ENTITY,
                "SignUp",
                HeaderMap::new(),
                params(json!({
                    "Email": email,
                    "FirstName": "Kim",
                    "LastName": "Ng",
                    "Password": "password1",
                })),
            )
            .await
            .unwrap();
        let id = reply["UUID"].as_str().unwrap().to_string();
        let token = board.table.validation_token(&id).unwrap();
        board
            .call(
                ENTITY,
                "Validate",
                HeaderMap::new(),
                params(json!({"Email": email, "ValidationToken": token})),
            )
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_sign_up_validate_login() {
        let board = Board::connected().await;
        let id = sign_up_and_validate(&board, "Kim@Example.com").await;

        let err = board
            .call(
                ENTITY,
                "Login",
                HeaderMap::new(),
                params(json!({"Email": "kim@example.com", "Password": "nope"})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::Rejected { status, .. } if status == StatusCode::UNAUTHORIZED));

        let reply = board
            .call(
                ENTITY,
                "Login",
                HeaderMap::new(),
                params(json!({"Email": "kim@example.com", "Password": "password1"})),
            )
            .await
            .unwrap();
        assert_eq!(reply["Account"]["UUID"], json!(id));
        assert!(reply["Account"].get("PasswordHash").is_none());
        let token = reply["SessionKey"].as_str().unwrap();
        let session = board.registry.sessions().get(token).unwrap();
        assert_eq!(session.account_id().as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn test_duplicate_sign_up_reports_identifier() {
        let board = Board::connected().await;
        sign_up_and_validate(&board, "kim@example.com").await;
        let err = board
            .call(
                ENTITY,
                "SignUp",
                HeaderMap::new(),
                params(json!({
                    "Email": "kim@example.com",
                    "FirstName": "Kim",
                    "LastName": "Ng",
                    "Password": "password2",
                })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "The identifier kim@example.com already exists!");
    }

    #[tokio::test]
    async fn test_sign_up_replies_created() {
        let board = Board::connected().await;
        let reply = board
            .reply(
                ENTITY,
                "SignUp",
                HeaderMap::new(),
                params(json!({
                    "Email": "ada@example.com",
                    "FirstName": "Ada",
                    "LastName": "Byron",
                    "Password": "password1",
                })),
            )
            .await
            .unwrap();
        assert_eq!(reply.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_unvalidated_account_cannot_log_in() {
        let board = Board::connected().await;
        board
            .call(
                ENTITY,
                "SignUp",
                HeaderMap::new(),
                params(json!({
                    "Email": "lee@example.com",
                    "FirstName": "Lee",
                    "LastName": "Park",
                    "Password": "password1",
                })),
            )
            .await
            .unwrap();
        let err = board
            .call(
                ENTITY,
                "Login",
                HeaderMap::new(),
                params(json!({"Email": "lee@example.com", "Password": "password1"})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::Rejected { status, .. } if status == StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn test_change_password_updates_shared_instance() {
        let board = Board::connected().await;
        let id = sign_up_and_validate(&board, "kim@example.com").await;
        let reply = board
            .call(
                ENTITY,
                "Login",
                HeaderMap::new(),
                params(json!({"Email": "kim@example.com", "Password": "password1"})),
            )
            .await
            .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(reply["SessionKey"].as_str().unwrap()).unwrap(),
        );

        board
            .call(
                ENTITY,
                "ChangePassword",
                headers.clone(),
                params(json!({"Password": "password1", "NewPassword": "password2"})),
            )
            .await
            .unwrap();

        let cached = board.registry.store().accounts().get(&id).unwrap();
        assert!(verify_password(
            &cached.read().unwrap().password_hash,
            "password2"
        ));
        assert!(verify_password(&board.table.password_hash(&id).unwrap(), "password2"));

        board
            .call(ENTITY, "Logout", headers.clone(), params(json!({})))
            .await
            .unwrap();
        let err = board
            .call(
                ENTITY,
                "ChangePassword",
                headers,
                params(json!({"Password": "password2", "NewPassword": "password3"})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::Unauthorized));
    }

    #[tokio::test]
    async fn test_login_sets_session_cookie() {
        let board = Board::connected().await;
        sign_up_and_validate(&board, "kim@example.com").await;
        let response = board
            .dispatcher
            .handle(
                ENTITY,
                "Login",
                HeaderMap::new(),
                params(json!({"Email": "kim@example.com", "Password": "password1"})),
                Responder::for_http(&HeaderMap::new()),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response.headers()[SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("LOGIN_SESSION_KEY="));
    }
}
