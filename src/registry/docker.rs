//! Container-backed resources, run through `testcontainers`.
//!
//! All calls are blocking and must run off the async runtime
//! (`spawn_blocking`). Networks named by a [`ContainerSpec`] are created
//! by the container runtime on first use and removed once the last
//! container attached to them is gone.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::SyncRunner;
use testcontainers::{Container, GenericImage, ImageExt};

use super::{Resource, ResourceError, ResourceInfo};

/// Used when a spec names no startup timeout.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

const PORT_POLL: Duration = Duration::from_millis(100);

/// A resource reachable over TCP from the test process.
pub trait Connectable {
    fn host(&self) -> &str;

    /// Host port mapped to `container_port`, if published.
    fn mapped_port(&self, container_port: u16) -> Option<u16>;
}

/// Readiness condition checked before a container is handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitStrategy {
    /// A line containing `message` appears in the container log.
    Log { message: String, stream: LogStream },
    /// Every exposed port accepts TCP connections from the host.
    ListeningPorts,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogStream {
    #[default]
    Stdout,
    Stderr,
}

/// How to run a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub exposed_ports: Vec<u16>,
    pub env: BTreeMap<String, String>,
    pub network: Option<String>,
    /// Overrides the image's default command.
    pub command: Vec<String>,
    pub wait: Vec<WaitStrategy>,
    pub startup_timeout: Option<Duration>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    fn startup_timeout(&self) -> Duration {
        self.startup_timeout.unwrap_or(DEFAULT_STARTUP_TIMEOUT)
    }

    fn image(&self) -> GenericImage {
        let (name, tag) = split_image(&self.image);
        let mut image = GenericImage::new(name, tag);
        for &port in &self.exposed_ports {
            image = image.with_exposed_port(port.tcp());
        }
        for wait in &self.wait {
            if let WaitStrategy::Log { message, stream } = wait {
                image = image.with_wait_for(match stream {
                    LogStream::Stdout => WaitFor::message_on_stdout(message.as_str()),
                    LogStream::Stderr => WaitFor::message_on_stderr(message.as_str()),
                });
            }
        }
        image
    }

    fn run(&self) -> Result<Container<GenericImage>, ResourceError> {
        let mut request = self.image().with_startup_timeout(self.startup_timeout());
        for (name, value) in &self.env {
            request = request.with_env_var(name, value);
        }
        if let Some(network) = &self.network {
            request = request.with_network(network);
        }
        if !self.command.is_empty() {
            request = request.with_cmd(&self.command);
        }
        Ok(request.start()?)
    }
}

/// Split `registry:5000/name:tag` into name and tag. No tag means
/// `latest`.
fn split_image(image: &str) -> (&str, &str) {
    let last_segment = image.rfind('/').map_or(0, |i| i + 1);
    match image[last_segment..].rfind(':') {
        Some(i) => {
            let at = last_segment + i;
            (&image[..at], &image[at + 1..])
        }
        None => (image, "latest"),
    }
}

/// A container started from a [`ContainerSpec`].
pub struct DockerContainer {
    spec: ContainerSpec,
    id: String,
    host: String,
    ports: BTreeMap<u16, u16>,
    running: Mutex<Option<Container<GenericImage>>>,
}

impl DockerContainer {
    pub fn new(spec: ContainerSpec) -> Self {
        Self {
            spec,
            id: String::new(),
            host: "localhost".into(),
            ports: BTreeMap::new(),
            running: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Option<&str> {
        Some(self.id.as_str()).filter(|id| !id.is_empty())
    }

    /// Block until every mapped port accepts connections or the startup
    /// timeout runs out.
    fn wait_for_ports(&self) -> Result<(), ResourceError> {
        let deadline = Instant::now() + self.spec.startup_timeout();
        for (&container_port, &host_port) in &self.ports {
            let addr = (self.host.as_str(), host_port)
                .to_socket_addrs()
                .map_err(|e| ResourceError::Start(format!("cannot resolve {}: {e}", self.host)))?
                .next()
                .ok_or_else(|| ResourceError::Start(format!("no address for {}", self.host)))?;
            loop {
                if TcpStream::connect_timeout(&addr, PORT_POLL).is_ok() {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(ResourceError::Start(format!(
                        "port {container_port} (host {host_port}) not listening after {:?}",
                        self.spec.startup_timeout()
                    )));
                }
                std::thread::sleep(PORT_POLL);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for DockerContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DockerContainer")
            .field("image", &self.spec.image)
            .field("id", &self.id)
            .field("ports", &self.ports)
            .finish_non_exhaustive()
    }
}

impl Resource for DockerContainer {
    fn start(&mut self) -> Result<(), ResourceError> {
        tracing::debug!(image = %self.spec.image, "starting container");
        let container = self.spec.run()?;
        self.id = container.id().to_string();
        self.host = container.get_host()?.to_string();
        let mut ports = BTreeMap::new();
        for &port in &self.spec.exposed_ports {
            ports.insert(port, container.get_host_port_ipv4(port.tcp())?);
        }
        self.ports = ports;
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(container);

        if self.spec.wait.contains(&WaitStrategy::ListeningPorts) {
            self.wait_for_ports()?;
        }
        tracing::debug!(id = %self.id, ports = ?self.ports, "container running");
        Ok(())
    }

    fn info(&self) -> ResourceInfo {
        ResourceInfo {
            image: self.spec.image.clone(),
            id: self.id.clone(),
        }
    }

    fn close(&self) -> Result<(), ResourceError> {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match running {
            Some(container) => Ok(container.rm()?),
            None => Ok(()),
        }
    }
}

impl Connectable for DockerContainer {
    fn host(&self) -> &str {
        &self.host
    }

    fn mapped_port(&self, container_port: u16) -> Option<u16> {
        self.ports.get(&container_port).copied()
    }
}
