//! HTTP front: `/<Entity>/<Action>?<query>` requests and WebSocket upgrades.
//!
//! Everything goes through one fallback handler so that path parsing,
//! shutdown rejection and the upgrade handshake stay in this module rather
//! than in axum's router.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::core::dispatcher::{Dispatcher, Params};
use crate::core::responder::{Responder, apply_cors};
use crate::core::session::Session;
use crate::error::{BoardError, ProtocolError};
use crate::websocket::codec::{Frame, compute_handshake_accept};
use crate::websocket::connection::{Connection, ConnectionHandle};
use crate::websocket::message::{ControlAction, Message};

const ARR_DISABLE_SESSION_AFFINITY: HeaderName =
    HeaderName::from_static("arr-disable-session-affinity");

/// Builds the router serving every path through the dispatcher.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new().fallback(serve_request).with_state(dispatcher)
}

async fn serve_request(State(dispatcher): State<Arc<Dispatcher>>, request: Request) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let responder = Responder::for_http(request.headers());
    debug!(
        method = %request.method(),
        uri = %request.uri(),
        remote = ?remote,
        "Request"
    );

    if dispatcher.registry().is_shutting_down() {
        return reported(responder.report_error(
            "Server is shutting down",
            StatusCode::SERVICE_UNAVAILABLE,
        ));
    }

    if request.method() == Method::OPTIONS {
        let mut headers = HeaderMap::new();
        apply_cors(&mut headers, request.headers().get(http::header::ORIGIN));
        return (StatusCode::NO_CONTENT, headers).into_response();
    }

    if is_upgrade_request(request.headers()) {
        return upgrade(dispatcher, request, remote);
    }

    let path = request.uri().path();
    if path == "/favicon.ico" {
        return reported(responder.report_error("Not found", StatusCode::NOT_FOUND));
    }
    let Some((entity, action)) = split_path(path) else {
        let err = BoardError::bad_request(format!("Invalid request path: {}", path));
        return reported(dispatcher.recover(err, &responder));
    };
    let (entity, action) = (entity.to_string(), action.to_string());
    let params = query_params(request.uri().query());
    let headers = request.headers().clone();

    reported(
        dispatcher
            .handle(&entity, &action, headers, params, responder)
            .await,
    )
}

fn reported(response: Option<Response>) -> Response {
    response.unwrap_or_else(|| StatusCode::NO_CONTENT.into_response())
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

/// `/Entity/Action` → `("Entity", "Action")`.
fn split_path(path: &str) -> Option<(&str, &str)> {
    let mut parts = path.trim_matches('/').split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(entity), Some(action), None) if !entity.is_empty() && !action.is_empty() => {
            Some((entity, action))
        }
        _ => None,
    }
}

fn query_params(query: Option<&str>) -> Params {
    let mut params = Params::new();
    if let Some(query) = query {
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            params.insert(name.into_owned(), Value::String(value.into_owned()));
        }
    }
    params
}

/// Params carried by a WebSocket message. A non-object value is exposed
/// under `Value`.
fn message_params(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        Value::Null => Params::new(),
        other => {
            let mut params = Params::new();
            params.insert("Value".to_string(), other);
            params
        }
    }
}

fn upgrade(dispatcher: Arc<Dispatcher>, mut request: Request, remote: Option<SocketAddr>) -> Response {
    let headers = request.headers().clone();
    let session = match dispatcher.authorize(None, None, &headers, &Params::new()) {
        Ok(Some(session)) => session,
        _ => {
            info!("Upgrade refused for {:?}: no session", remote);
            return (
                StatusCode::UNAUTHORIZED,
                [(CONNECTION, "close")],
                "Authorization required",
            )
                .into_response();
        }
    };

    let accept = headers
        .get(SEC_WEBSOCKET_KEY)
        .and_then(|key| key.to_str().ok())
        .map(|key| compute_handshake_accept(key.trim()))
        .and_then(|accept| HeaderValue::from_str(&accept).ok());
    let Some(accept) = accept else {
        let err = BoardError::from(ProtocolError::Handshake(
            "missing Sec-WebSocket-Key".to_string(),
        ));
        return reported(dispatcher.recover(err, &Responder::for_http(&headers)));
    };

    let on_upgrade = hyper::upgrade::on(&mut request);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                serve_upgraded(dispatcher, session, headers, TokioIo::new(upgraded), remote).await
            }
            Err(e) => warn!("Upgrade for {:?} failed: {}", remote, e),
        }
    });

    let mut response_headers = HeaderMap::new();
    response_headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    response_headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    response_headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    response_headers.insert(ARR_DISABLE_SESSION_AFFINITY, HeaderValue::from_static("true"));
    (StatusCode::SWITCHING_PROTOCOLS, response_headers, Body::empty()).into_response()
}

/// Runs an upgraded stream for `session` until it closes.
pub async fn serve_upgraded<S>(
    dispatcher: Arc<Dispatcher>,
    session: Arc<Session>,
    headers: HeaderMap,
    stream: S,
    remote: Option<SocketAddr>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connection = Connection::new(stream, remote, dispatcher.registry().codec());
    let handle = connection.handle();
    handle.mark_upgraded();
    session.bind_connection(&handle);
    info!("Connection upgraded: {}", handle.details());

    let result = connection
        .run(|frame| {
            let dispatcher = Arc::clone(&dispatcher);
            let handle = Arc::clone(&handle);
            let headers = headers.clone();
            async move { on_frame(&dispatcher, handle, headers, frame).await }
        })
        .await;
    if let Err(e) = result {
        warn!("Connection {} ended with error: {}", handle.details(), e);
    }

    if !session.release_connection(&handle) {
        debug!("Session already moved off connection {}", handle.id());
    }
}

async fn on_frame(
    dispatcher: &Dispatcher,
    connection: Arc<ConnectionHandle>,
    headers: HeaderMap,
    frame: Frame,
) {
    let Some(message) = Message::from_frame(&frame) else {
        return;
    };

    if let Some(entity) = message.entity.as_deref() {
        let responder = Responder::for_connection(Arc::clone(&connection), entity, &message.action);
        let params = message_params(message.value.clone());
        dispatcher
            .handle(entity, &message.action, headers, params, responder)
            .await;
        return;
    }

    match message.control_action() {
        Some(ControlAction::Heartbeat) => {
            if let Err(e) = connection.write(&message) {
                debug!("Heartbeat echo dropped: {}", e);
            }
        }
        Some(action) => debug!("Ignoring client control action {}", action.as_str()),
        None => warn!(
            "Discarding {} message without entity from {}",
            message.class,
            connection.details()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/Account/Login"), Some(("Account", "Login")));
        assert_eq!(split_path("/Account/Login/"), Some(("Account", "Login")));
        assert_eq!(split_path("/Account"), None);
        assert_eq!(split_path("/a/b/c"), None);
        assert_eq!(split_path("//Login"), None);
    }

    #[test]
    fn test_query_params_are_form_decoded() {
        let params = query_params(Some("Email=kim%40example.com&Name=Kim+Ng"));
        assert_eq!(params["Email"], json!("kim@example.com"));
        assert_eq!(params["Name"], json!("Kim Ng"));
        assert!(query_params(None).is_empty());
    }

    #[test]
    fn test_message_params_wraps_scalars() {
        assert_eq!(message_params(json!({"A": 1}))["A"], json!(1));
        assert_eq!(message_params(json!("x"))["Value"], json!("x"));
        assert!(message_params(Value::Null).is_empty());
    }

    #[test]
    fn test_upgrade_detection_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        assert!(!is_upgrade_request(&headers));
        headers.insert(UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_upgrade_request(&headers));
    }
}
