//! Configuration-driven container provider.
//!
//! Any image can be turned into a test resource from configuration:
//!
//! ```text
//! containers.redis.image-name    = redis:7
//! containers.redis.exposed-ports = [{ "redis.port": 6379 }]
//! containers.redis.hostnames     = redis.host
//! containers.redis.env           = { "MODE": "test" }
//! containers.redis.network       = it-net
//! containers.redis.command       = redis-server --save ""
//! containers.redis.startup-timeout         = 30s
//! containers.redis.wait-strategy.log.message = Ready to accept connections
//! containers.redis.wait-strategy.port      = true
//! ```
//!
//! Keys may be flat (as above) or nested under a `containers` map.
//! `wait-strategy` may also name a single strategy (`port`). A `log`
//! strategy needs a `message` and reads stdout unless `stream = stderr`.
//! This provider sorts after every specific provider.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::{Properties, PropertyEntries, Provider, ProviderError};
use crate::ipc::codec::Value;
use crate::registry::docker::{Connectable, ContainerSpec, DockerContainer, LogStream, WaitStrategy};
use crate::registry::{ResourceKey, ResourceRegistry};
use crate::scope::{self, Scope};

pub const NAME: &str = "generic";

/// Sorts after every specific provider.
pub const GENERIC_PRIORITY: i32 = i32::MAX;

const CONTAINERS: &str = "containers";
const WAIT_STRATEGY: &str = "wait-strategy";

/// One `containers.<id>` block.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ContainerConfig {
    id: String,
    image: Option<String>,
    /// Property name → container port.
    ports: Vec<(String, u16)>,
    hostnames: Vec<String>,
    env: BTreeMap<String, String>,
    network: Option<String>,
    command: Vec<String>,
    startup_timeout: Option<Duration>,
    wait: Vec<WaitStrategy>,
}

impl ContainerConfig {
    /// Every container block in `config`, ordered by id.
    fn all(config: &Properties) -> Result<Vec<Self>, ProviderError> {
        let mut ids: Vec<String> = Vec::new();
        if let Some(Value::Map(nested)) = config.get(CONTAINERS) {
            ids.extend(nested.keys().filter_map(Value::as_str).map(str::to_string));
        }
        let prefix = format!("{CONTAINERS}.");
        for key in config.keys() {
            if let Some((id, _)) = key.strip_prefix(&prefix).and_then(|rest| rest.split_once('.')) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        ids.dedup();
        ids.into_iter().map(|id| Self::parse(id, config)).collect()
    }

    fn parse(id: String, config: &Properties) -> Result<Self, ProviderError> {
        let lookup = |name: &str| field(config, &id, name);

        let image = match lookup("image-name") {
            None => None,
            Some(Value::String(image)) => Some(image),
            Some(other) => return Err(config_error(&id, "image-name", "expected a string", &other)),
        };

        let mut ports = Vec::new();
        match lookup("exposed-ports") {
            None => {}
            Some(Value::List(items)) => {
                for item in &items {
                    ports.extend(port_map(&id, item)?);
                }
            }
            Some(single @ Value::Map(_)) => ports.extend(port_map(&id, &single)?),
            Some(other) => {
                return Err(config_error(&id, "exposed-ports", "expected a list of maps", &other));
            }
        }

        let hostnames = match lookup("hostnames") {
            None => Vec::new(),
            Some(Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            Some(Value::List(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(other) => return Err(config_error(&id, "hostnames", "expected a list", &other)),
        };

        let env = match lookup("env") {
            None => BTreeMap::new(),
            Some(Value::Map(map)) => map
                .iter()
                .filter_map(|(k, v)| Some((k.as_str()?.to_string(), v.to_string())))
                .collect(),
            Some(other) => return Err(config_error(&id, "env", "expected a map", &other)),
        };

        let network = lookup("network").and_then(|v| v.as_str().map(str::to_string));

        let command = match lookup("command") {
            None => Vec::new(),
            Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
            Some(Value::List(items)) => items.iter().map(Value::to_string).collect(),
            Some(other) => return Err(config_error(&id, "command", "expected a string or list", &other)),
        };

        let startup_timeout = match lookup("startup-timeout") {
            None => None,
            Some(value) => Some(
                parse_duration(&value)
                    .ok_or_else(|| config_error(&id, "startup-timeout", "expected a duration", &value))?,
            ),
        };

        let wait = wait_strategies(&id, config)?;

        Ok(Self {
            id,
            image,
            ports,
            hostnames,
            env,
            network,
            command,
            startup_timeout,
            wait,
        })
    }

    fn answers(&self, name: &str) -> bool {
        self.ports.iter().any(|(p, _)| p == name) || self.hostnames.iter().any(|h| h == name)
    }

    fn spec(&self, image: &str) -> ContainerSpec {
        ContainerSpec {
            image: image.to_string(),
            exposed_ports: self.ports.iter().map(|(_, port)| *port).collect(),
            env: self.env.clone(),
            network: self.network.clone(),
            command: self.command.clone(),
            wait: self.wait.clone(),
            startup_timeout: self.startup_timeout,
        }
    }
}

/// Look up `containers.<id>.<name>` flat, then nested.
fn field(config: &Properties, id: &str, name: &str) -> Option<Value> {
    if let Some(value) = config.get(&format!("{CONTAINERS}.{id}.{name}")) {
        return Some(value.clone()).filter(|v| !v.is_null());
    }
    let nested = config.get(CONTAINERS)?.as_map()?;
    let block = nested.get(&Value::from(id))?.as_map()?;
    block.get(&Value::from(name)).filter(|v| !v.is_null()).cloned()
}

/// Strategy names under `wait-strategy`, in first-seen order.
fn wait_strategy_names(id: &str, config: &Properties) -> Result<Vec<String>, ProviderError> {
    let mut names = Vec::new();
    match field(config, id, WAIT_STRATEGY) {
        None => {}
        Some(Value::String(name)) => names.push(name),
        Some(Value::Map(map)) => names.extend(map.keys().map(Value::to_string)),
        Some(other) => {
            return Err(config_error(id, WAIT_STRATEGY, "expected a strategy name or map", &other));
        }
    }
    let prefix = format!("{CONTAINERS}.{id}.{WAIT_STRATEGY}.");
    for key in config.keys() {
        if let Some(rest) = key.strip_prefix(&prefix) {
            names.push(rest.split_once('.').map_or(rest, |(name, _)| name).to_string());
        }
    }
    let mut seen = Vec::with_capacity(names.len());
    for name in names {
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    Ok(seen)
}

fn wait_strategies(id: &str, config: &Properties) -> Result<Vec<WaitStrategy>, ProviderError> {
    wait_strategy_names(id, config)?
        .into_iter()
        .map(|name| match name.trim() {
            "port" => Ok(WaitStrategy::ListeningPorts),
            "log" => log_strategy(id, config),
            other => Err(ProviderError::Config {
                key: format!("{CONTAINERS}.{id}.{WAIT_STRATEGY}"),
                message: format!("unknown wait strategy {other:?}"),
            }),
        })
        .collect()
}

fn log_strategy(id: &str, config: &Properties) -> Result<WaitStrategy, ProviderError> {
    let message_key = format!("{WAIT_STRATEGY}.log.message");
    let message = match wait_field(config, id, "log", "message") {
        Some(Value::String(message)) if !message.is_empty() => message,
        None => {
            return Err(ProviderError::Config {
                key: format!("{CONTAINERS}.{id}.{message_key}"),
                message: "missing".into(),
            });
        }
        Some(other) => return Err(config_error(id, &message_key, "expected a non-empty string", &other)),
    };
    let stream = match wait_field(config, id, "log", "stream") {
        None => LogStream::default(),
        Some(value) => match value.as_str().map(str::to_ascii_lowercase).as_deref() {
            Some("stdout") => LogStream::Stdout,
            Some("stderr") => LogStream::Stderr,
            _ => {
                let key = format!("{WAIT_STRATEGY}.log.stream");
                return Err(config_error(id, &key, "expected stdout or stderr", &value));
            }
        },
    };
    Ok(WaitStrategy::Log { message, stream })
}

/// Look up `wait-strategy.<strategy>.<name>` flat, then nested.
fn wait_field(config: &Properties, id: &str, strategy: &str, name: &str) -> Option<Value> {
    if let Some(value) = field(config, id, &format!("{WAIT_STRATEGY}.{strategy}.{name}")) {
        return Some(value);
    }
    let block = field(config, id, WAIT_STRATEGY)?;
    let value = block
        .as_map()?
        .get(&Value::from(strategy))?
        .as_map()?
        .get(&Value::from(name))?;
    Some(value.clone()).filter(|v| !v.is_null())
}

/// Whole seconds as an integer, or a string with an `ms`, `s` or `m`
/// suffix. A bare number in a string is seconds.
fn parse_duration(value: &Value) -> Option<Duration> {
    let text = match value {
        Value::Int(secs) => return u64::try_from(*secs).ok().map(Duration::from_secs),
        Value::String(s) => s.trim(),
        _ => return None,
    };
    let (digits, unit) = match text.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => text.split_at(i),
        None => (text, "s"),
    };
    let amount: u64 = digits.parse().ok()?;
    match unit.trim() {
        "ms" => Some(Duration::from_millis(amount)),
        "s" => Some(Duration::from_secs(amount)),
        "m" => amount.checked_mul(60).map(Duration::from_secs),
        _ => None,
    }
}

fn port_map(id: &str, value: &Value) -> Result<Vec<(String, u16)>, ProviderError> {
    let Some(map) = value.as_map() else {
        return Err(config_error(id, "exposed-ports", "expected a map", value));
    };
    map.iter()
        .map(|(property, port)| {
            let property = property
                .as_str()
                .ok_or_else(|| config_error(id, "exposed-ports", "expected string keys", property))?;
            let port = match port {
                Value::Int(p) => u16::try_from(*p).ok(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            }
            .ok_or_else(|| config_error(id, "exposed-ports", "expected a port number", port))?;
            Ok((property.to_string(), port))
        })
        .collect()
}

fn config_error(id: &str, name: &str, message: &str, actual: &Value) -> ProviderError {
    ProviderError::Config {
        key: format!("{CONTAINERS}.{id}.{name}"),
        message: format!("{message}, got {actual}"),
    }
}

/// Catch-all provider backed by plain Docker containers.
pub struct GenericContainerProvider {
    registry: Arc<ResourceRegistry>,
}

impl GenericContainerProvider {
    pub fn new(registry: Arc<ResourceRegistry>) -> Self {
        Self { registry }
    }
}

impl Provider for GenericContainerProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        GENERIC_PRIORITY
    }

    fn resolvable_properties(&self, _: &PropertyEntries, config: &Properties) -> Vec<String> {
        let containers = match ContainerConfig::all(config) {
            Ok(containers) => containers,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring invalid container configuration");
                return Vec::new();
            }
        };
        containers
            .iter()
            .flat_map(|c| {
                c.ports
                    .iter()
                    .map(|(property, _)| property.clone())
                    .chain(c.hostnames.iter().cloned())
            })
            .collect()
    }

    fn required_properties(&self, _: &str) -> Vec<String> {
        vec![scope::PROPERTY_KEY.to_string()]
    }

    fn resolve(
        &self,
        name: &str,
        properties: &Properties,
        config: &Properties,
    ) -> Result<Option<String>, ProviderError> {
        let Some(container) = ContainerConfig::all(config)?
            .into_iter()
            .find(|c| c.answers(name))
        else {
            return Ok(None);
        };
        let image = container.image.clone().ok_or_else(|| ProviderError::Config {
            key: format!("{CONTAINERS}.{}.image-name", container.id),
            message: "missing".into(),
        })?;

        let scope = Scope::from_properties(properties);
        let mut params = properties.clone();
        params.remove(scope::PROPERTY_KEY);
        let key = ResourceKey::new(NAME, &container.id, scope, &params);
        let spec = container.spec(&image);
        let running = self
            .registry
            .get_or_create(name, key, || Ok(DockerContainer::new(spec)))?;

        if container.hostnames.iter().any(|h| h == name) {
            return Ok(Some(running.host().to_string()));
        }
        let Some((_, port)) = container.ports.iter().find(|(p, _)| p == name) else {
            return Ok(None);
        };
        running
            .mapped_port(*port)
            .map(|mapped| Some(mapped.to_string()))
            .ok_or_else(|| {
                ProviderError::Unavailable(format!(
                    "container {} does not publish port {port}",
                    container.id
                ))
            })
    }
}
