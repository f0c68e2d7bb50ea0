//! Client side of the test resources server.
//!
//! [`bootstrap`] finds or launches the shared server, [`ServerClient`]
//! talks to it, and [`lazy`] turns its answers into placeholders that
//! test code resolves on demand. [`run`] backs the one-shot CLI
//! commands.

pub mod bootstrap;
mod format;
pub mod keepalive;
pub mod lazy;
pub mod server_client;
pub mod settings;

use std::path::{Path, PathBuf};

pub use bootstrap::{BootstrapOptions, ProcessServerFactory, ServerFactory, start_or_connect, stop_server};
pub use server_client::ServerClient;
pub use settings::ServerSettings;

use crate::cli::ClientAction;
use crate::ipc::codec::{CodecError, Value};
use crate::ipc::protocol::ProtocolError;
use crate::resolver::Properties;

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cannot reach server at {uri}: {source}")]
    Transport {
        uri: String,
        source: reqwest::Error,
    },
    #[error("server answered {status}: {message}")]
    Server { status: u16, message: String },
    #[error("malformed response: {0}")]
    Codec(#[from] CodecError),
    #[error("unexpected response: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("{0}")]
    Usage(String),
    #[error("invalid settings file {path}: {message}")]
    Settings { path: PathBuf, message: String },
    #[error("a server is already running on port {running}, cannot start one on port {requested}")]
    PortConflict { running: u16, requested: u16 },
    #[error("server on port {0} did not become available")]
    Unavailable(u16),
    #[error("port file {0} stayed empty")]
    EmptyPortFile(PathBuf),
    #[error("no server running (no settings in {0})")]
    NotRunning(PathBuf),
    #[error("failed to launch server: {0}")]
    Launch(std::io::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Run a one-shot client command against the server recorded in
/// `settings_dir`.
pub async fn run(action: ClientAction, settings_dir: &Path) -> Result<(), ClientError> {
    let settings = ServerSettings::read(settings_dir)
        .await?
        .ok_or_else(|| ClientError::NotRunning(settings_dir.to_path_buf()))?;
    let client = ServerClient::new(&settings)?;

    match action {
        ClientAction::List => {
            let names = client.resolvable_properties().await?;
            format::print_names(&names, "No resolvable properties");
        }
        ClientAction::Entries => {
            let names = client.required_property_entries().await?;
            format::print_names(&names, "No required entries");
        }
        ClientAction::Requirements { expression } => {
            let names = client.required_properties(&expression).await?;
            format::print_names(&names, "No required properties");
        }
        ClientAction::Resolve {
            name,
            properties,
            config,
        } => {
            let properties = parse_pairs(&properties)?;
            let config = parse_pairs(&config)?;
            let value = client.resolve(&name, &properties, &config).await?;
            format::print_resolved(&name, value.as_deref());
        }
        ClientAction::Close { scope } => {
            let closed = client.close_scope(&scope).await?;
            format::print_closed(Some(&scope), closed);
        }
        ClientAction::CloseAll => {
            let closed = client.close_all().await?;
            format::print_closed(None, closed);
        }
        ClientAction::Resources { scope, json } => {
            let resources = client.resources(scope.as_deref()).await?;
            format::print_resources(&resources, json)?;
        }
    }

    Ok(())
}

/// Start or reuse the shared server and print where it runs.
pub async fn start(options: &BootstrapOptions) -> Result<ServerSettings, ClientError> {
    let settings = start_or_connect(&ProcessServerFactory, options).await?;
    format::print_started(&settings);
    Ok(settings)
}

/// Stop the shared server and print the outcome.
pub async fn stop(settings_dir: &Path) -> Result<bool, ClientError> {
    let stopped = stop_server(settings_dir).await?;
    format::print_stopped(stopped);
    Ok(stopped)
}

/// Parse `key=value` arguments into string properties.
fn parse_pairs(pairs: &[String]) -> Result<Properties, ClientError> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), Value::from(value)))
            }
            _ => Err(ClientError::Usage(format!(
                "expected KEY=VALUE, got {pair:?}"
            ))),
        })
        .collect()
}
