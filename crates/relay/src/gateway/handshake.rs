//! WebSocket upgrade checks.
//!
//! Everything a connection needs is decided while the upgrade request is
//! still in hand: the origin is checked, the Auth Guard resolves the caller,
//! and the `format` query parameter picks the outbound wire format. A request
//! that fails any check is answered with a plain HTTP error and never becomes
//! a WebSocket.

use protocol::WireFormat;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};

use crate::auth::{AuthGuard, Identity};

/// Outcome of a successful upgrade.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Authenticated caller.
    pub identity: Identity,
    /// Outbound wire format.
    pub format: WireFormat,
}

/// Validates an upgrade request.
pub fn check_request(
    request: &Request,
    guard: &AuthGuard,
    allowed_origins: &[String],
) -> Result<Handshake, ErrorResponse> {
    if !origin_allowed(request, allowed_origins) {
        return Err(reject(StatusCode::FORBIDDEN, "origin not allowed"));
    }

    let identity = guard
        .authenticate(request)
        .map_err(|e| reject(StatusCode::UNAUTHORIZED, &e.to_string()))?;

    let format = match query_param(request, "format") {
        Some(name) => WireFormat::from_name(&name)
            .map_err(|e| reject(StatusCode::BAD_REQUEST, &e.to_string()))?,
        None => WireFormat::default(),
    };

    Ok(Handshake { identity, format })
}

/// An empty allow-list accepts any origin.
fn origin_allowed(request: &Request, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(|origin| {
            let origin = origin.trim_end_matches('/');
            allowed
                .iter()
                .any(|a| a == "*" || a.trim_end_matches('/').eq_ignore_ascii_case(origin))
        })
        .unwrap_or(false)
}

fn query_param(request: &Request, name: &str) -> Option<String> {
    let query = request.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn reject(status: StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() = status;
    response
}
