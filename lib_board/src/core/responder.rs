//! # Responder
//!
//! The single place a handler result or failure becomes bytes on a transport.
//! Over HTTP the result is a JSON envelope with CORS headers; on an upgraded
//! connection it is one text frame.

use std::sync::Arc;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use base64::{Engine, prelude::BASE64_STANDARD};
use bytes::Bytes;
use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE, HeaderName, ORIGIN,
};
use http::{HeaderMap, HeaderValue, StatusCode};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::BoardError;
use crate::websocket::connection::ConnectionHandle;
use crate::websocket::message::Message;

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
const ALLOWED_METHODS: &str = "GET, POST, PUT, OPTIONS";
const ALLOWED_HEADERS: &str = "Authorization, Content-Type";

#[derive(Debug, Clone)]
pub enum ReplyBody {
    Json(Value),
    Bytes { mime: String, data: Bytes },
    Empty,
}

/// What a handler hands back on success.
#[derive(Debug, Clone)]
pub struct Reply {
    body: ReplyBody,
    status: StatusCode,
    headers: HeaderMap,
}

impl Reply {
    fn new(body: ReplyBody) -> Self {
        Self {
            body,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
        }
    }

    pub fn json(value: Value) -> Self {
        Self::new(ReplyBody::Json(value))
    }

    /// Serializes `result` into the `Result` field of the envelope.
    pub fn success<T: Serialize>(result: &T) -> Result<Self, BoardError> {
        serde_json::to_value(result)
            .map(Self::json)
            .map_err(|e| BoardError::Unrecoverable(format!("unserializable reply: {}", e)))
    }

    pub fn bytes(mime: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::new(ReplyBody::Bytes {
            mime: mime.into(),
            data: data.into(),
        })
    }

    pub fn empty() -> Self {
        Self::new(ReplyBody::Empty)
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Extra HTTP header; ignored on upgraded transports.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn body(&self) -> &ReplyBody {
        &self.body
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope<'a> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<&'a str>,
}

fn success_envelope(result: &Value) -> Value {
    serde_json::to_value(Envelope {
        success: true,
        result: Some(result),
        error_message: None,
    })
    .unwrap_or(Value::Null)
}

fn error_envelope(message: &str) -> Value {
    serde_json::to_value(Envelope {
        success: false,
        result: None,
        error_message: Some(message),
    })
    .unwrap_or(Value::Null)
}

/// Where a response goes.
#[derive(Debug, Clone)]
pub enum Responder {
    Http {
        origin: Option<HeaderValue>,
    },
    WebSocket {
        connection: Arc<ConnectionHandle>,
        entity: String,
        action: String,
    },
}

impl Responder {
    pub fn for_http(headers: &HeaderMap) -> Self {
        Responder::Http {
            origin: headers.get(ORIGIN).cloned(),
        }
    }

    pub fn for_connection(connection: Arc<ConnectionHandle>, entity: &str, action: &str) -> Self {
        Responder::WebSocket {
            connection,
            entity: entity.to_string(),
            action: action.to_string(),
        }
    }

    pub fn connection(&self) -> Option<&Arc<ConnectionHandle>> {
        match self {
            Responder::Http { .. } => None,
            Responder::WebSocket { connection, .. } => Some(connection),
        }
    }

    /// Delivers a successful reply. HTTP yields the response to send; an
    /// upgraded transport is written to directly and yields `None`.
    pub fn respond(&self, reply: Reply) -> Option<Response> {
        match self {
            Responder::Http { origin } => {
                let mut headers = reply.headers;
                apply_cors(&mut headers, origin.as_ref());
                let body = match reply.body {
                    ReplyBody::Json(value) => {
                        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
                        Body::from(success_envelope(&value).to_string())
                    }
                    ReplyBody::Bytes { mime, data } => {
                        match HeaderValue::from_str(&mime) {
                            Ok(value) => {
                                headers.insert(CONTENT_TYPE, value);
                            }
                            Err(_) => warn!("Dropping invalid content type {:?}", mime),
                        }
                        Body::from(data)
                    }
                    ReplyBody::Empty => Body::empty(),
                };
                Some((reply.status, headers, body).into_response())
            }
            Responder::WebSocket {
                connection,
                entity,
                action,
            } => {
                let value = match reply.body {
                    ReplyBody::Json(value) => success_envelope(&value),
                    ReplyBody::Bytes { mime, data } => success_envelope(&json!({
                        "MimeType": mime,
                        "Base64": BASE64_STANDARD.encode(&data),
                    })),
                    ReplyBody::Empty => success_envelope(&Value::Null),
                };
                let message = Message::response(entity, action, value);
                if let Err(e) = connection.write(&message) {
                    warn!("Reply to {} dropped: {}", connection.details(), e);
                }
                None
            }
        }
    }

    /// Delivers a failure message with `status` (HTTP) or as an async error
    /// message (upgraded transport).
    pub fn report_error(&self, message: &str, status: StatusCode) -> Option<Response> {
        match self {
            Responder::Http { origin } => {
                debug!("Reporting {} to client: {}", status, message);
                let mut headers = HeaderMap::new();
                apply_cors(&mut headers, origin.as_ref());
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
                Some((status, headers, error_envelope(message).to_string()).into_response())
            }
            Responder::WebSocket { connection, .. } => {
                if let Err(e) = connection.write(&Message::async_error(message)) {
                    warn!("Error report to {} dropped: {}", connection.details(), e);
                }
                None
            }
        }
    }
}

/// Adds the CORS headers every HTTP response carries.
pub fn apply_cors(headers: &mut HeaderMap, origin: Option<&HeaderValue>) {
    headers.insert(
        ACCESS_CONTROL_ALLOW_ORIGIN,
        origin.cloned().unwrap_or_else(|| HeaderValue::from_static("*")),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOWED_HEADERS),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use crate::websocket::codec::FrameCodec;
    use crate::websocket::connection::Connection;
    use tokio::io::duplex;

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_http_success_envelope_and_cors() {
        let mut request_headers = HeaderMap::new();
        request_headers.insert(ORIGIN, HeaderValue::from_static("https://board.example"));
        let responder = Responder::for_http(&request_headers);

        let response = responder
            .respond(Reply::json(json!({"UUID": "x"})))
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "https://board.example");
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_METHODS], ALLOWED_METHODS);
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_HEADERS], ALLOWED_HEADERS);
        assert_eq!(
            body_json(response).await,
            json!({"Success": true, "Result": {"UUID": "x"}})
        );
    }

    #[tokio::test]
    async fn test_http_error_envelope_defaults_origin() {
        let responder = Responder::for_http(&HeaderMap::new());
        let response = responder
            .report_error("Unauthorized request", StatusCode::UNAUTHORIZED)
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(
            body_json(response).await,
            json!({"Success": false, "ErrorMessage": "Unauthorized request"})
        );
    }

    #[tokio::test]
    async fn test_raw_bytes_keep_their_mime_type() {
        let responder = Responder::for_http(&HeaderMap::new());
        let response = responder
            .respond(Reply::bytes("text/html", "<p>hi</p>"))
            .unwrap();
        assert_eq!(response.headers()[CONTENT_TYPE], "text/html");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"<p>hi</p>");
    }

    #[tokio::test]
    async fn test_websocket_responder_writes_frames() {
        let (server, _client) = duplex(1024);
        let connection = Connection::new(server, None, FrameCodec::default());
        let handle = connection.handle();
        let responder = Responder::for_connection(Arc::clone(&handle), "Account", "Login");

        assert!(responder.respond(Reply::json(json!(1))).is_none());
        assert!(responder.report_error("nope", StatusCode::BAD_REQUEST).is_none());
        assert!(Arc::ptr_eq(responder.connection().unwrap(), &handle));
    }
}
