use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const FRAME_PREVIEW_LIMIT: usize = 256;

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started_at = Instant::now();

    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started_at.elapsed().as_millis();

    info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        duration_ms = elapsed_ms,
        "request summary"
    );

    if status.is_client_error() && status.as_u16() != 404 {
        warn!(method = %method, path = %path, status = status.as_u16(), "rejected request");
    }

    response
}

/// Printable, bounded rendering of a raw frame for log lines.
pub fn frame_preview(frame: &[u8]) -> String {
    let text = String::from_utf8_lossy(frame);
    let mut preview: String = text.chars().take(FRAME_PREVIEW_LIMIT).collect();
    if text.chars().count() > FRAME_PREVIEW_LIMIT {
        preview.push_str("...");
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_frames_are_shown_whole() {
        assert_eq!(frame_preview(br#"{"kind":"oops"}"#), r#"{"kind":"oops"}"#);
    }

    #[test]
    fn long_and_binary_frames_are_bounded() {
        let long = vec![b'a'; FRAME_PREVIEW_LIMIT * 2];
        let preview = frame_preview(&long);
        assert_eq!(preview.len(), FRAME_PREVIEW_LIMIT + 3);
        assert!(preview.ends_with("..."));

        assert_eq!(frame_preview(&[0xff, b'x']), "\u{fffd}x");
    }
}
