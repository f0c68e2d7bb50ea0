//! Locate a running server or launch a new one.
//!
//! A client first consults the shared settings file and probes the
//! recorded port; only if nothing answers does it launch a server,
//! wait for it to announce its port, and record the new settings for
//! later clients.

use std::collections::BTreeMap;
use std::fs::File;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use tokio::net::TcpStream;

use super::ClientError;
use super::server_client::ServerClient;
use super::settings::{PORT_FILE, ServerSettings};

/// Interval between port file checks.
pub const PORT_FILE_POLL: Duration = Duration::from_millis(200);

/// Reads of an existing but empty port file before giving up.
pub const MAX_PORT_READS: usize = 10;

/// Availability probes after the port is known; the delay doubles from
/// [`FIRST_PROBE_DELAY`].
pub const AVAILABILITY_PROBES: u32 = 8;
pub const FIRST_PROBE_DELAY: Duration = Duration::from_millis(25);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// How to launch a server process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessParameters {
    pub program: PathBuf,
    pub arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
    /// Server stdout/stderr go here; discarded when `None`.
    pub log_file: Option<PathBuf>,
}

/// Process-launching facility used by [`start_or_connect`].
pub trait ServerFactory: Send + Sync {
    /// Launch the server described by `params` without waiting for it.
    fn start_server(&self, params: &ProcessParameters) -> io::Result<()>;

    /// Pause between polls.
    fn wait_for(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

/// Launches the server as a detached child process in its own session.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessServerFactory;

impl ServerFactory for ProcessServerFactory {
    fn start_server(&self, params: &ProcessParameters) -> io::Result<()> {
        use std::os::unix::process::CommandExt;

        let (stdout, stderr) = match &params.log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = File::options().create(true).append(true).open(path)?;
                (Stdio::from(file.try_clone()?), Stdio::from(file))
            }
            None => (Stdio::null(), Stdio::null()),
        };

        let mut command = Command::new(&params.program);
        command
            .args(&params.arguments)
            .envs(&params.environment)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        // SAFETY: setsid() is async-signal-safe and touches no memory
        // shared with the parent.
        unsafe {
            command.pre_exec(|| nix::unistd::setsid().map(drop).map_err(io::Error::from));
        }
        let mut child = command.spawn()?;
        tracing::info!(
            pid = child.id(),
            program = %params.program.display(),
            "server process launched"
        );
        // Reap the child when it exits.
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(())
    }
}

/// What a client wants from the server it connects to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapOptions {
    pub settings_dir: PathBuf,
    /// Require the server on this port. `None` lets the server pick.
    pub explicit_port: Option<u16>,
    pub access_token: Option<String>,
    pub client_read_timeout: Option<Duration>,
    pub idle_timeout_minutes: Option<u32>,
    /// Server executable and where its output goes.
    pub program: PathBuf,
    pub log_file: Option<PathBuf>,
}

impl BootstrapOptions {
    fn process_parameters(&self, port_file: &Path) -> ProcessParameters {
        let mut arguments = vec!["server".to_string()];
        match self.explicit_port {
            Some(port) => arguments.push(format!("--port={port}")),
            None => arguments.push(format!("--port-file={}", port_file.display())),
        }
        if let Some(minutes) = self.idle_timeout_minutes {
            arguments.push(format!("--idle-timeout-minutes={minutes}"));
        }
        let mut environment = BTreeMap::new();
        if let Some(token) = &self.access_token {
            environment.insert("TESTRESD_ACCESS_TOKEN".to_string(), token.clone());
        }
        ProcessParameters {
            program: self.program.clone(),
            arguments,
            environment,
            log_file: self.log_file.clone(),
        }
    }
}

/// Connect to the server recorded in the settings, or launch one.
///
/// # Errors
///
/// `PortConflict` when a live server is recorded on a different port
/// than `explicit_port`. Launch and availability failures are reported
/// as-is; nothing is retried.
pub async fn start_or_connect<F: ServerFactory>(
    factory: &F,
    options: &BootstrapOptions,
) -> Result<ServerSettings, ClientError> {
    let dir = &options.settings_dir;
    if let Some(settings) = ServerSettings::read(dir).await? {
        if is_server_started(settings.port).await {
            if let Some(requested) = options.explicit_port.filter(|p| *p != settings.port) {
                return Err(ClientError::PortConflict {
                    running: settings.port,
                    requested,
                });
            }
            tracing::debug!(port = settings.port, "reusing running server");
            return Ok(settings);
        }
        tracing::info!(port = settings.port, "recorded server is gone, launching a new one");
    }

    let port_file = dir.join(PORT_FILE);
    remove_if_exists(&port_file).await?;
    tokio::fs::create_dir_all(dir).await?;

    factory
        .start_server(&options.process_parameters(&port_file))
        .map_err(ClientError::Launch)?;

    let port = match options.explicit_port {
        Some(port) => port,
        None => wait_for_port_file(factory, &port_file).await?,
    };
    wait_for_availability(factory, port).await?;

    let settings = ServerSettings {
        port,
        access_token: options.access_token.clone(),
        client_read_timeout: options.client_read_timeout,
        idle_timeout_minutes: options.idle_timeout_minutes,
    };
    settings.write(dir).await?;
    remove_if_exists(&port_file).await?;
    tracing::info!(port, "server started");
    Ok(settings)
}

/// Stop the server recorded in `dir` and forget its settings.
///
/// Returns `false` when no settings exist. The settings file is removed
/// even if the server could not be reached.
pub async fn stop_server(dir: &Path) -> Result<bool, ClientError> {
    let Some(settings) = ServerSettings::read(dir).await? else {
        return Ok(false);
    };
    let client = ServerClient::new(&settings)?;
    let stopped = match client.stop().await {
        Ok(stopped) => stopped,
        Err(e) => {
            tracing::warn!(port = settings.port, error = %e, "stop request failed");
            false
        }
    };
    ServerSettings::delete(dir).await?;
    Ok(stopped)
}

/// Whether something accepts TCP connections on loopback `port`.
pub async fn is_server_started(port: u16) -> bool {
    matches!(
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Poll until the port file exists and holds a port. No overall
/// deadline: a server that never announces itself blocks the caller.
async fn wait_for_port_file<F: ServerFactory>(factory: &F, path: &Path) -> Result<u16, ClientError> {
    let mut empty_reads = 0;
    loop {
        match tokio::fs::read_to_string(path).await {
            Ok(text) if text.trim().is_empty() => {
                empty_reads += 1;
                if empty_reads >= MAX_PORT_READS {
                    return Err(ClientError::EmptyPortFile(path.to_path_buf()));
                }
            }
            Ok(text) => {
                return text.trim().parse().map_err(|_| ClientError::Settings {
                    path: path.to_path_buf(),
                    message: format!("not a port number: {:?}", text.trim()),
                });
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        factory.wait_for(PORT_FILE_POLL).await;
    }
}

async fn wait_for_availability<F: ServerFactory>(factory: &F, port: u16) -> Result<(), ClientError> {
    let mut delay = FIRST_PROBE_DELAY;
    for _ in 0..AVAILABILITY_PROBES {
        if is_server_started(port).await {
            return Ok(());
        }
        factory.wait_for(delay).await;
        delay *= 2;
    }
    Err(ClientError::Unavailable(port))
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
