//! Server process: hosts the resolution engine and the resource
//! registry behind an HTTP endpoint bound to loopback.
//!
//! Lifecycle: bind, announce the port through the port file, serve until
//! `/stop`, idle expiry, SIGTERM or SIGINT cancels the shutdown token,
//! let in-flight requests finish, then close every resource.

mod access;
mod expiry;
mod handler;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use access::AccessPolicy;
pub use expiry::ExpiryManager;
pub use handler::build_router;

use crate::ipc::codec::CodecError;
use crate::ipc::protocol::ProtocolError;
use crate::registry::ResourceRegistry;
use crate::resolver::{self, ResolutionEngine, ResolveError};

/// Delay between answering `/stop` and shutting down, so that the
/// response reaches the caller.
pub const STOP_DELAY: Duration = Duration::from_millis(200);

/// Server error type.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("failed to write port file {path}: {source}")]
    PortFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed body: {0}")]
    Codec(#[from] CodecError),
    #[error("bad request: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("cannot read body: {0}")]
    Body(String),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::Codec(_) | ServerError::Protocol(_) | ServerError::Body(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::warn!(%status, error = %self, "request failed");
        (status, self.to_string()).into_response()
    }
}

/// Server startup parameters.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Port to bind on loopback; 0 picks a free one.
    pub port: u16,
    /// Where to announce the bound port.
    pub port_file: Option<PathBuf>,
    /// Token every request must present, if set.
    pub access_token: Option<String>,
    /// Shut down after this long without requests. `None` disables it.
    pub idle_timeout: Option<Duration>,
}

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ResolutionEngine>,
    pub registry: Arc<ResourceRegistry>,
    pub expiry: Arc<ExpiryManager>,
    pub access: Arc<AccessPolicy>,
    pub shutdown: CancellationToken,
}

/// A bound, not yet serving, server.
pub struct Server {
    listener: TcpListener,
    state: AppState,
}

impl Server {
    /// Bind on loopback and build the engine with the builtin providers.
    pub async fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local = listener.local_addr()?;

        let registry = Arc::new(ResourceRegistry::new());
        let providers =
            resolver::builtin_providers(registry.clone(), format!("http://localhost:{}", local.port()));
        let state = AppState {
            engine: Arc::new(ResolutionEngine::new(providers)),
            registry,
            expiry: Arc::new(ExpiryManager::new(config.idle_timeout)),
            access: Arc::new(AccessPolicy::new(config.access_token.clone())),
            shutdown: CancellationToken::new(),
        };
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Serve until the shutdown token is cancelled, then close every
    /// resource.
    pub async fn serve(self) -> Result<(), ServerError> {
        let Self { listener, state } = self;
        let shutdown = state.shutdown.clone();
        let registry = state.registry.clone();
        let checker = expiry::spawn_checker(state.expiry.clone(), shutdown.clone());

        let app = build_router(state);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

        checker.abort();
        tracing::info!("server stopped, closing resources");
        tokio::task::spawn_blocking(move || registry.close_all()).await?;
        Ok(())
    }
}

/// Run the server until stopped.
///
/// # Errors
///
/// Returns `ServerError` if binding fails or the port file cannot be
/// written.
pub async fn run(config: ServerConfig) -> Result<(), ServerError> {
    let server = Server::bind(&config).await?;
    let addr = server.local_addr()?;

    if let Some(path) = &config.port_file {
        write_port_file(path, addr.port())
            .await
            .map_err(|source| ServerError::PortFile {
                path: path.clone(),
                source,
            })?;
    }
    tracing::info!(
        %addr,
        idle_timeout = ?config.idle_timeout,
        token = config.access_token.is_some(),
        "server listening"
    );

    let token = server.shutdown_token();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    });

    server.serve().await
}

/// Write `port` to `path` through a temporary file so that readers never
/// see a partial number.
async fn write_port_file(path: &Path, port: u16) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, port.to_string()).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn port_file_holds_only_the_port() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("port");
        write_port_file(&path, 40123).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "40123");
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn bind_picks_an_ephemeral_port() {
        let server = Server::bind(&ServerConfig::default()).await.unwrap();
        let addr = server.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn cancelled_server_returns() {
        let server = Server::bind(&ServerConfig::default()).await.unwrap();
        let token = server.shutdown_token();
        let task = tokio::spawn(server.serve());
        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
