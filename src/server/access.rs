//! Access control: loopback origin plus optional shared token.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::ipc::protocol::ACCESS_TOKEN_HEADER;

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Denied {
    #[error("remote address {0} is not loopback")]
    NotLoopback(IpAddr),
    #[error("missing or wrong access token")]
    BadToken,
}

#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    token: Option<String>,
}

impl AccessPolicy {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
        }
    }

    pub fn check(&self, remote: IpAddr, presented: Option<&str>) -> Result<(), Denied> {
        if !remote.to_canonical().is_loopback() {
            return Err(Denied::NotLoopback(remote));
        }
        match &self.token {
            Some(expected) if presented != Some(expected.as_str()) => Err(Denied::BadToken),
            _ => Ok(()),
        }
    }
}

/// Middleware rejecting requests that fail [`AccessPolicy::check`].
pub async fn enforce_access(
    State(policy): State<Arc<AccessPolicy>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(ACCESS_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    if let Err(denied) = policy.check(remote.ip(), presented) {
        tracing::warn!(%remote, path = %request.uri().path(), reason = %denied, "request denied");
        return (StatusCode::UNAUTHORIZED, denied.to_string()).into_response();
    }
    next.run(request).await
}
