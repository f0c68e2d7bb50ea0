//! Answers the address of the server itself, so that test code can
//! reach the server through ordinary configuration.

use super::{Properties, PropertyEntries, Provider, ProviderError};

pub const PROPERTY: &str = "test-resources.server.uri";

pub struct ServerUriProvider {
    uri: String,
}

impl ServerUriProvider {
    pub fn new(uri: String) -> Self {
        Self { uri }
    }
}

impl Provider for ServerUriProvider {
    fn name(&self) -> &str {
        "server-uri"
    }

    fn resolvable_properties(&self, _: &PropertyEntries, _: &Properties) -> Vec<String> {
        vec![PROPERTY.to_string()]
    }

    fn resolve(
        &self,
        name: &str,
        _: &Properties,
        _: &Properties,
    ) -> Result<Option<String>, ProviderError> {
        Ok((name == PROPERTY).then(|| self.uri.clone()))
    }
}
