//! Provider abstraction and the resolution engine.
//!
//! A [`Provider`] answers a set of configuration property names,
//! optionally provisioning a backing resource through the registry.
//! Providers are composed at startup by [`builtin_providers`]; new ones
//! plug in by implementing the trait and being added to that list.

pub mod engine;
pub mod env;
pub mod generic;
pub mod server_uri;

use std::collections::BTreeMap;
use std::sync::Arc;

pub use engine::{ResolutionEngine, ResolveError};
pub use env::{MapEnvironment, PropertyEnvironment};

use crate::ipc::codec::Value;
use crate::registry::{RegistryError, ResourceRegistry};

/// Property name → value. Used both for resolved properties and for the
/// raw test-resources configuration.
pub type Properties = BTreeMap<String, Value>;

/// Entry group name → member names, e.g. `datasources → [default]`.
pub type PropertyEntries = BTreeMap<String, Vec<String>>;

/// Errors returned by providers.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error(transparent)]
    Resource(#[from] RegistryError),

    /// Configuration present but unusable (wrong type, missing image).
    #[error("configuration {key}: {message}")]
    Config { key: String, message: String },

    /// The resource started but cannot answer the property.
    #[error("{0}")]
    Unavailable(String),
}

/// A unit that can answer specific property names.
///
/// `Send + Sync` is required because the engine is shared across request
/// tasks.
pub trait Provider: Send + Sync {
    /// Stable name, used for toggling (`<name>.enabled`) and logs.
    fn name(&self) -> &str;

    /// Lower values are tried first. Ties keep registration order.
    fn priority(&self) -> i32 {
        0
    }

    fn is_enabled(&self, config: &Properties) -> bool {
        enabled_in(self.name(), config)
    }

    /// Property names this provider can answer given the entry groups.
    fn resolvable_properties(&self, entries: &PropertyEntries, config: &Properties) -> Vec<String>;

    /// Entry groups whose members must be enumerated before listing.
    fn required_property_entries(&self) -> Vec<String> {
        Vec::new()
    }

    /// Properties that must be known before `expression` is resolved.
    fn required_properties(&self, expression: &str) -> Vec<String> {
        let _ = expression;
        Vec::new()
    }

    /// Whether this provider takes part in resolving `name`. Must not
    /// provision anything.
    fn can_resolve(&self, name: &str, entries: &PropertyEntries, config: &Properties) -> bool {
        self.resolvable_properties(entries, config)
            .iter()
            .any(|p| p == name)
    }

    /// Resolve `name`. `Ok(None)` means "not mine" and lets the next
    /// provider answer.
    fn resolve(
        &self,
        name: &str,
        properties: &Properties,
        config: &Properties,
    ) -> Result<Option<String>, ProviderError>;
}

/// Read `<name>.enabled` from `config`. Absent means enabled; strings
/// other than `true` (any case) mean disabled.
pub fn enabled_in(name: &str, config: &Properties) -> bool {
    match config.get(&format!("{name}.enabled")) {
        None | Some(Value::Null) => true,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
        Some(_) => true,
    }
}

/// The statically linked provider list, most specific first.
pub fn builtin_providers(
    registry: Arc<ResourceRegistry>,
    server_uri: String,
) -> Vec<Arc<dyn Provider>> {
    vec![
        Arc::new(server_uri::ServerUriProvider::new(server_uri)),
        Arc::new(generic::GenericContainerProvider::new(registry)),
    ]
}
