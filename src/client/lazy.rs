//! Client-side lazy configuration.
//!
//! Test code sees every resolvable property as a placeholder of the form
//! `${auto.test.resources.<key>}`. Nothing is provisioned until a
//! placeholder is actually resolved.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::ClientError;
use super::server_client::ServerClient;
use crate::resolver::engine::sanitize_config;
use crate::resolver::{Properties, PropertyEntries, PropertyEnvironment};

pub const PLACEHOLDER_PREFIX: &str = "auto.test.resources.";

/// `${auto.test.resources.<key>}`.
pub fn placeholder(key: &str) -> String {
    format!("${{{PLACEHOLDER_PREFIX}{key}}}")
}

/// The property key behind a placeholder, with or without the `${…}`
/// wrapper. `None` if `expression` is not a placeholder.
pub fn placeholder_key(expression: &str) -> Option<&str> {
    let inner = expression
        .strip_prefix("${")
        .and_then(|e| e.strip_suffix('}'))
        .unwrap_or(expression);
    inner
        .strip_prefix(PLACEHOLDER_PREFIX)
        .filter(|key| !key.is_empty())
}

/// Placeholder values for every property the server can resolve.
#[derive(Debug, Clone, Default)]
pub struct LazyPropertySource {
    placeholders: BTreeMap<String, String>,
}

impl LazyPropertySource {
    /// Ask the server which properties it can resolve, given the entry
    /// group members found in `env`.
    pub async fn load(
        client: &ServerClient,
        env: &dyn PropertyEnvironment,
        config: &Properties,
    ) -> Result<Self, ClientError> {
        let entries: PropertyEntries = client
            .required_property_entries()
            .await?
            .into_iter()
            .map(|group| {
                let members = env.property_entries(&group);
                (group, members)
            })
            .collect();
        let keys = client.list(&entries, &sanitize_config(config)).await?;
        tracing::debug!(count = keys.len(), "lazy properties loaded");
        Ok(Self {
            placeholders: keys
                .into_iter()
                .map(|key| {
                    let value = placeholder(&key);
                    (key, value)
                })
                .collect(),
        })
    }

    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.placeholders.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.placeholders.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.placeholders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placeholders.is_empty()
    }
}

/// Resolves placeholders against the server on demand.
#[derive(Debug, Clone)]
pub struct LazyExpressionResolver {
    client: Arc<ServerClient>,
    config: Properties,
}

impl LazyExpressionResolver {
    pub fn new(client: Arc<ServerClient>, config: &Properties) -> Self {
        Self {
            client,
            config: sanitize_config(config),
        }
    }

    /// Resolve one placeholder. Expressions that are not placeholders
    /// resolve to `None` without contacting the server.
    pub async fn resolve(
        &self,
        expression: &str,
        env: &dyn PropertyEnvironment,
    ) -> Result<Option<String>, ClientError> {
        let Some(key) = placeholder_key(expression) else {
            return Ok(None);
        };
        let properties: Properties = self
            .client
            .required_properties(key)
            .await?
            .into_iter()
            .filter_map(|name| env.property(&name).map(|value| (name, value)))
            .collect();
        self.client.resolve(key, &properties, &self.config).await
    }

    /// Resolve several placeholders concurrently. Fails on the first
    /// error.
    pub async fn resolve_all(
        &self,
        expressions: &[&str],
        env: &dyn PropertyEnvironment,
    ) -> Result<Vec<Option<String>>, ClientError> {
        futures::future::try_join_all(expressions.iter().map(|e| self.resolve(e, env))).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::ipc::codec::Value;
    use crate::registry::ResourceRegistry;
    use crate::resolver::{MapEnvironment, Provider, ProviderError, ResolutionEngine};
    use crate::server::{AccessPolicy, AppState, ExpiryManager, build_router};

    /// `datasources.<name>.url`, built from `db.vendor`.
    struct Datasources;

    impl Provider for Datasources {
        fn name(&self) -> &str {
            "datasources"
        }

        fn resolvable_properties(&self, entries: &PropertyEntries, _: &Properties) -> Vec<String> {
            entries
                .get("datasources")
                .into_iter()
                .flatten()
                .map(|m| format!("datasources.{m}.url"))
                .collect()
        }

        fn required_property_entries(&self) -> Vec<String> {
            vec!["datasources".into()]
        }

        fn required_properties(&self, _: &str) -> Vec<String> {
            vec!["db.vendor".into()]
        }

        fn can_resolve(&self, name: &str, _: &PropertyEntries, _: &Properties) -> bool {
            name.starts_with("datasources.") && name.ends_with(".url")
        }

        fn resolve(
            &self,
            name: &str,
            properties: &Properties,
            config: &Properties,
        ) -> Result<Option<String>, ProviderError> {
            let vendor = properties
                .get("db.vendor")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let host = config.get("db.host").and_then(Value::as_str).unwrap_or("localhost");
            let member = name.split('.').nth(1).unwrap_or_default();
            Ok(Some(format!("{vendor}://{host}/{member}")))
        }
    }

    async fn serve() -> (Arc<ServerClient>, CancellationToken) {
        let state = AppState {
            engine: Arc::new(ResolutionEngine::new(vec![Arc::new(Datasources)])),
            registry: Arc::new(ResourceRegistry::new()),
            expiry: Arc::new(ExpiryManager::new(None)),
            access: Arc::new(AccessPolicy::new(None)),
            shutdown: CancellationToken::new(),
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());
        let shutdown = state.shutdown.clone();
        let app = build_router(state).into_make_service_with_connect_info::<std::net::SocketAddr>();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
                .unwrap();
        });
        let client = ServerClient::with_uri(&uri, None, Duration::from_secs(5)).unwrap();
        (Arc::new(client), shutdown)
    }

    fn env() -> MapEnvironment {
        let mut props = Properties::new();
        props.insert("datasources.default.username".into(), Value::from("sa"));
        props.insert("datasources.users.username".into(), Value::from("sa"));
        props.insert("db.vendor".into(), Value::from("postgres"));
        MapEnvironment::new(props)
    }

    #[test]
    fn placeholder_round_trip() {
        let p = placeholder("datasources.default.url");
        assert_eq!(p, "${auto.test.resources.datasources.default.url}");
        assert_eq!(placeholder_key(&p), Some("datasources.default.url"));
        assert_eq!(
            placeholder_key("auto.test.resources.redis.port"),
            Some("redis.port")
        );
        assert_eq!(placeholder_key("${datasources.default.url}"), None);
        assert_eq!(placeholder_key("${auto.test.resources.}"), None);
    }

    #[tokio::test]
    async fn source_lists_placeholders_for_env_members() {
        let (client, shutdown) = serve().await;
        let source = LazyPropertySource::load(&client, &env(), &Properties::new())
            .await
            .unwrap();
        assert_eq!(
            source.property_names().collect::<Vec<_>>(),
            vec!["datasources.default.url", "datasources.users.url"]
        );
        assert_eq!(
            source.get("datasources.users.url"),
            Some("${auto.test.resources.datasources.users.url}")
        );
        assert_eq!(source.get("datasources.other.url"), None);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn disabled_provider_yields_empty_source() {
        let (client, shutdown) = serve().await;
        let mut config = Properties::new();
        config.insert("test-resources.datasources.enabled".into(), Value::Bool(false));
        let source = LazyPropertySource::load(&client, &env(), &config).await.unwrap();
        assert!(source.is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn resolver_sends_required_properties_and_config() {
        let (client, shutdown) = serve().await;
        let mut config = Properties::new();
        config.insert("test-resources.db.host".into(), Value::from("db.internal"));
        let resolver = LazyExpressionResolver::new(client, &config);

        assert_eq!(
            resolver
                .resolve("${auto.test.resources.datasources.users.url}", &env())
                .await
                .unwrap()
                .as_deref(),
            Some("postgres://db.internal/users")
        );
        assert_eq!(resolver.resolve("${plain.key}", &env()).await.unwrap(), None);

        let all = resolver
            .resolve_all(
                &[
                    "${auto.test.resources.datasources.default.url}",
                    "${auto.test.resources.unknown}",
                ],
                &env(),
            )
            .await
            .unwrap();
        assert_eq!(
            all,
            vec![Some("postgres://db.internal/default".to_string()), None]
        );
        shutdown.cancel();
    }
}
