//! Static resource retrieval from `resource_dir`.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use http::header::CONTENT_DISPOSITION;
use http::{HeaderValue, StatusCode};
use lib_board::BoardError;
use lib_board::core::{AccessPolicy, DispatcherBuilder, HandlerRequest, Reply};
use tracing::debug;

pub const ENTITY: &str = "Storage";
pub const FILE_NAME: &str = "FileName";

/// Client resources anyone may fetch.
pub const PUBLIC_FILES: &[&str] = &[
    "resources/client.js",
    "resources/client.html",
    "resources/password_reset.js",
    "resources/password_reset.html",
    "resources/legal_agreement.html",
];

/// Email templates are previewable without a session.
pub const PUBLIC_PATTERN: &str = r"^templates/email/[^/]+\.html$";

pub fn policy(policy: AccessPolicy) -> Result<AccessPolicy, BoardError> {
    policy.allow_resource(
        ENTITY,
        "Retrieve",
        FILE_NAME,
        PUBLIC_FILES.iter().copied(),
        Some(PUBLIC_PATTERN),
    )
}

pub fn register(builder: &mut DispatcherBuilder, resource_dir: PathBuf) {
    let root = Arc::new(resource_dir);
    builder.register(ENTITY, "Retrieve", move |request| {
        retrieve(Arc::clone(&root), request)
    });
}

fn mime_for(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    Some(match extension.as_str() {
        "js" => "application/javascript; charset=utf-8",
        "json" => "application/json; charset=utf-8",
        "pdf" => "application/pdf",
        "html" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        _ => return None,
    })
}

/// `name` as a path below the resource root, or `None` if it could escape it.
fn confined_path(name: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    let mut confined = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => confined.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!confined.as_os_str().is_empty()).then_some(confined)
}

async fn retrieve(root: Arc<PathBuf>, request: HandlerRequest) -> Result<Reply, BoardError> {
    let name = request.param(FILE_NAME)?;
    let relative = confined_path(&name)
        .ok_or_else(|| BoardError::bad_request(format!("Invalid resource path: {}", name)))?;
    let mime = mime_for(&relative).ok_or_else(|| {
        BoardError::bad_request(format!(
            "Unknown mime type: {}",
            relative.extension().and_then(|e| e.to_str()).unwrap_or("")
        ))
    })?;

    let path = root.join(&relative);
    let not_found = |e: std::io::Error| match e.kind() {
        ErrorKind::NotFound => BoardError::rejected(
            format!("Could not locate requested resource: {}", name),
            StatusCode::NOT_FOUND,
        ),
        _ => BoardError::rejected(
            format!("Could not read {}: {}", name, e),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    };

    let metadata = tokio::fs::metadata(&path).await.map_err(not_found)?;
    if !metadata.is_file() {
        return Err(BoardError::bad_request(format!(
            "Object exists but is not a file: {}",
            name
        )));
    }
    let data = tokio::fs::read(&path).await.map_err(not_found)?;
    debug!("Serving {} ({} bytes, {})", path.display(), data.len(), mime);

    let mut reply = Reply::bytes(mime, data);
    let base = relative
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    if let Ok(value) = HeaderValue::from_str(&format!("inline; filename=\"{}\"", base)) {
        reply = reply.with_header(CONTENT_DISPOSITION, value);
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board_logic::testing::{Board, params};
    use http::HeaderMap;
    use lib_board::core::ReplyBody;
    use serde_json::json;
    use std::fs;

    #[test]
    fn test_confined_path_rejects_escapes() {
        assert_eq!(
            confined_path("./resources/client.js"),
            Some(PathBuf::from("resources/client.js"))
        );
        assert!(confined_path("../secret.txt").is_none());
        assert!(confined_path("resources/../../secret.txt").is_none());
        assert!(confined_path("/etc/passwd").is_none());
        assert!(confined_path("").is_none());
    }

    #[test]
    fn test_mime_by_extension() {
        assert_eq!(
            mime_for(Path::new("a/b.HTML")),
            Some("text/html; charset=utf-8")
        );
        assert_eq!(mime_for(Path::new("doc.pdf")), Some("application/pdf"));
        assert!(mime_for(Path::new("image.bmp")).is_none());
        assert!(mime_for(Path::new("Makefile")).is_none());
    }

    #[tokio::test]
    async fn test_public_template_served_without_session() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("templates/email")).unwrap();
        fs::write(dir.path().join("templates/email/welcome.html"), "<p>hi</p>").unwrap();
        fs::write(dir.path().join("private.txt"), "secret").unwrap();
        let board = Board::with_resources(dir.path()).await;

        let reply = board
            .reply(
                ENTITY,
                "Retrieve",
                HeaderMap::new(),
                params(json!({"FileName": "templates/email/welcome.html"})),
            )
            .await
            .unwrap();
        match reply.body() {
            ReplyBody::Bytes { mime, data } => {
                assert_eq!(mime, "text/html; charset=utf-8");
                assert_eq!(&data[..], b"<p>hi</p>");
            }
            other => panic!("unexpected body {:?}", other),
        }

        let err = board
            .reply(
                ENTITY,
                "Retrieve",
                HeaderMap::new(),
                params(json!({"FileName": "private.txt"})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::Unauthorized));
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let board = Board::with_resources(dir.path()).await;
        let err = board
            .reply(
                ENTITY,
                "Retrieve",
                board.session_headers(),
                params(json!({"FileName": "missing.txt"})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::Rejected { status, .. } if status == StatusCode::NOT_FOUND));

        let err = board
            .reply(
                ENTITY,
                "Retrieve",
                board.session_headers(),
                params(json!({"FileName": "../outside.txt"})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::Rejected { status, .. } if status == StatusCode::BAD_REQUEST));
    }
}
