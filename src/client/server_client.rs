//! HTTP client for a running server.
//!
//! One method per server endpoint. Every call is a single request with
//! the access token attached; responses are decoded with the wire codec.

use std::time::Duration;

use reqwest::{Method, StatusCode, Url};

use super::ClientError;
use super::settings::ServerSettings;
use crate::ipc::codec::{self, Value};
use crate::ipc::protocol::{
    self, ACCESS_TOKEN_HEADER, CONTENT_TYPE, ListRequest, ResolveRequest, ResourceDescriptor,
};
use crate::resolver::{Properties, PropertyEntries};

/// Last segment of the close-all route, unusable as a scope name.
const CLOSE_ALL_SEGMENT: &str = "all";

/// Read timeout used when the settings do not name one.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ServerClient {
    http: reqwest::Client,
    base: Url,
    access_token: Option<String>,
}

impl ServerClient {
    pub fn new(settings: &ServerSettings) -> Result<Self, ClientError> {
        Self::with_uri(
            &settings.uri(),
            settings.access_token.clone(),
            settings.client_read_timeout.unwrap_or(DEFAULT_READ_TIMEOUT),
        )
    }

    pub fn with_uri(
        uri: &str,
        access_token: Option<String>,
        read_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let base = Url::parse(uri).map_err(|e| ClientError::Usage(format!("bad server URI {uri:?}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ClientError::Usage(format!("bad server URI {uri:?}")));
        }
        let http = reqwest::Client::builder()
            .timeout(read_timeout)
            .no_proxy()
            .build()
            .map_err(|source| ClientError::Transport {
                uri: uri.to_string(),
                source,
            })?;
        Ok(Self {
            http,
            base,
            access_token,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// `GET /list`.
    pub async fn resolvable_properties(&self) -> Result<Vec<String>, ClientError> {
        let value = self.call(Method::GET, protocol::PATH_LIST, &[], None).await?;
        Ok(protocol::string_list("list", &value)?)
    }

    /// `POST /list` with entry groups and configuration.
    pub async fn list(
        &self,
        property_entries: &PropertyEntries,
        config: &Properties,
    ) -> Result<Vec<String>, ClientError> {
        let request = ListRequest {
            property_entries: property_entries.clone(),
            config: config.clone(),
        };
        let value = self
            .call(Method::POST, protocol::PATH_LIST, &[], Some(&request.to_value()))
            .await?;
        Ok(protocol::string_list("list", &value)?)
    }

    pub async fn required_property_entries(&self) -> Result<Vec<String>, ClientError> {
        let value = self
            .call(Method::GET, protocol::PATH_REQUIRED_ENTRIES, &[], None)
            .await?;
        Ok(protocol::string_list("entries", &value)?)
    }

    pub async fn required_properties(&self, expression: &str) -> Result<Vec<String>, ClientError> {
        let value = self
            .call(Method::GET, protocol::PATH_REQUIRED_EXPR, &[expression], None)
            .await?;
        Ok(protocol::string_list("requirements", &value)?)
    }

    pub async fn resolve(
        &self,
        name: &str,
        properties: &Properties,
        config: &Properties,
    ) -> Result<Option<String>, ClientError> {
        let request = ResolveRequest {
            name: name.to_string(),
            properties: properties.clone(),
            config: config.clone(),
        };
        let value = self
            .call(Method::POST, protocol::PATH_RESOLVE, &[], Some(&request.to_value()))
            .await?;
        Ok(protocol::optional_string("resolve", &value)?)
    }

    pub async fn close_all(&self) -> Result<bool, ClientError> {
        let value = self.call(Method::GET, protocol::PATH_CLOSE_ALL, &[], None).await?;
        Ok(protocol::boolean("close", &value)?)
    }

    /// Close resources in `scope` and its descendants. The root scope and
    /// a scope named `all` are rejected: the first has no path segment and
    /// the second collides with the close-all route. Use
    /// [`close_all`](Self::close_all) for both.
    pub async fn close_scope(&self, scope: &str) -> Result<bool, ClientError> {
        if scope.is_empty() || scope == CLOSE_ALL_SEGMENT {
            return Err(ClientError::Usage(format!(
                "cannot close scope {scope:?} by name, close all resources instead"
            )));
        }
        let value = self
            .call(Method::GET, protocol::PATH_CLOSE, &[scope], None)
            .await?;
        Ok(protocol::boolean("close", &value)?)
    }

    /// Live resources, optionally limited to `scope` and its descendants.
    pub async fn resources(&self, scope: Option<&str>) -> Result<Vec<ResourceDescriptor>, ClientError> {
        let segments: Vec<&str> = scope.into_iter().filter(|s| !s.is_empty()).collect();
        let value = self
            .call(Method::GET, protocol::PATH_RESOURCES, &segments, None)
            .await?;
        match value {
            Value::List(items) => Ok(items
                .iter()
                .map(ResourceDescriptor::from_value)
                .collect::<Result<_, _>>()?),
            Value::Null => Ok(Vec::new()),
            other => Err(protocol::ProtocolError::UnexpectedKind {
                field: "resources",
                expected: "list",
                actual: other.kind(),
            }
            .into()),
        }
    }

    /// `POST /stop`.
    pub async fn stop(&self) -> Result<bool, ClientError> {
        let value = self.call(Method::POST, protocol::PATH_STOP, &[], None).await?;
        Ok(protocol::boolean("stop", &value)?)
    }

    fn url(&self, path: &str, extra: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| ClientError::Usage(format!("bad server URI {}", self.base)))?
            .pop_if_empty()
            .extend(path.trim_start_matches('/').split('/'))
            .extend(extra);
        Ok(url)
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        extra: &[&str],
        body: Option<&Value>,
    ) -> Result<Value, ClientError> {
        let url = self.url(path, extra)?;
        let mut request = self
            .http
            .request(method, url.clone())
            .header(reqwest::header::ACCEPT, CONTENT_TYPE);
        if let Some(token) = &self.access_token {
            request = request.header(ACCESS_TOKEN_HEADER, token);
        }
        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
                .body(codec::to_bytes(body)?);
        }

        let transport = |source| ClientError::Transport {
            uri: url.to_string(),
            source,
        };
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(transport)?;
        if status != StatusCode::OK {
            return Err(ClientError::Server {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&bytes).trim().to_string(),
            });
        }
        Ok(codec::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::registry::ResourceRegistry;
    use crate::resolver::server_uri::{self, ServerUriProvider};
    use crate::resolver::{Provider, ResolutionEngine};
    use crate::server::{AccessPolicy, AppState, ExpiryManager, build_router};

    /// Serve the real router on an ephemeral loopback port.
    async fn serve(token: Option<&str>) -> (String, AppState) {
        let providers: Vec<Arc<dyn Provider>> =
            vec![Arc::new(ServerUriProvider::new("http://localhost:1".into()))];
        let state = AppState {
            engine: Arc::new(ResolutionEngine::new(providers)),
            registry: Arc::new(ResourceRegistry::new()),
            expiry: Arc::new(ExpiryManager::new(None)),
            access: Arc::new(AccessPolicy::new(token.map(str::to_string))),
            shutdown: CancellationToken::new(),
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("http://localhost:{}", listener.local_addr().unwrap().port());
        let app = build_router(state.clone())
            .into_make_service_with_connect_info::<std::net::SocketAddr>();
        let shutdown = state.shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .unwrap();
        });
        (uri, state)
    }

    fn client(uri: &str, token: Option<&str>) -> ServerClient {
        ServerClient::with_uri(uri, token.map(str::to_string), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn url_appends_encoded_segments() {
        let client = client("http://localhost:9/", None);
        let url = client
            .url(protocol::PATH_REQUIRED_EXPR, &["a b/c"])
            .unwrap();
        assert_eq!(url.as_str(), "http://localhost:9/requirements/expr/a%20b%2Fc");
        let url = client.url(protocol::PATH_LIST, &[]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:9/list");
    }

    #[test]
    fn rejects_non_http_uri() {
        assert!(ServerClient::with_uri("mailto:x@y", None, DEFAULT_READ_TIMEOUT).is_err());
        assert!(ServerClient::with_uri("not a uri", None, DEFAULT_READ_TIMEOUT).is_err());
    }

    #[tokio::test]
    async fn full_round_trip_against_router() {
        let (uri, state) = serve(Some("tok")).await;
        let client = client(&uri, Some("tok"));

        assert_eq!(client.resolvable_properties().await.unwrap(), vec![server_uri::PROPERTY]);
        assert_eq!(
            client
                .resolve(server_uri::PROPERTY, &Properties::new(), &Properties::new())
                .await
                .unwrap()
                .as_deref(),
            Some("http://localhost:1")
        );
        assert_eq!(
            client
                .resolve("unknown.key", &Properties::new(), &Properties::new())
                .await
                .unwrap(),
            None
        );
        assert!(client.required_property_entries().await.unwrap().is_empty());
        assert!(client.required_properties("x.y").await.unwrap().is_empty());
        assert!(!client.close_all().await.unwrap());
        assert!(!client.close_scope("it.db").await.unwrap());
        assert!(client.resources(None).await.unwrap().is_empty());
        assert!(client.resources(Some("it")).await.unwrap().is_empty());

        assert!(client.stop().await.unwrap());
        tokio::time::timeout(Duration::from_secs(5), state.shutdown.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn close_scope_rejects_names_shadowed_by_close_all() {
        // Nothing listens here; the request must not be sent.
        let client = client("http://localhost:9/", None);
        for scope in ["all", ""] {
            let err = client.close_scope(scope).await.unwrap_err();
            assert!(matches!(err, ClientError::Usage(_)), "{scope:?}: {err}");
        }
        assert_eq!(
            protocol::PATH_CLOSE_ALL,
            format!("{}/{CLOSE_ALL_SEGMENT}", protocol::PATH_CLOSE)
        );
    }

    #[tokio::test]
    async fn wrong_token_is_a_server_error() {
        let (uri, state) = serve(Some("tok")).await;
        let err = client(&uri, Some("nope")).resolvable_properties().await.unwrap_err();
        assert!(matches!(err, ClientError::Server { status: 401, .. }));
        state.shutdown.cancel();
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = client(&format!("http://localhost:{port}"), None)
            .resolvable_properties()
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Transport { .. }));
    }
}
