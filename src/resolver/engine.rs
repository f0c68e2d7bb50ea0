//! Resolution engine: ordered provider dispatch with required-property
//! chaining.
//!
//! For a requested name the engine walks the enabled providers in
//! priority order. A provider takes part only if it advertises the name
//! (a side-effect free check); its required properties are then taken
//! from the environment or resolved recursively through the engine
//! before its `resolve` is called. The first answer wins.

use std::sync::Arc;

use super::env::{MapEnvironment, PropertyEnvironment};
use super::{Properties, PropertyEntries, Provider, ProviderError};
use crate::ipc::codec::Value;

/// Prefix stripped from configuration keys sent by older clients.
const CONFIG_PREFIX: &str = "test-resources.";

/// Bound on required-property chains.
pub const MAX_DEPTH: usize = 32;

/// Resolution error type.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("cyclic required properties: {}", chain.join(" -> "))]
    Cycle { chain: Vec<String> },

    #[error("required properties nested deeper than {MAX_DEPTH} resolving {property}")]
    TooDeep { property: String },

    #[error("provider {provider} failed to resolve {property}: {source}")]
    Provider {
        provider: String,
        property: String,
        #[source]
        source: ProviderError,
    },
}

/// Holds the provider list and dispatches requests to it.
pub struct ResolutionEngine {
    providers: Vec<Arc<dyn Provider>>,
}

impl ResolutionEngine {
    /// Build an engine, ordering `providers` by priority (stable).
    pub fn new(mut providers: Vec<Arc<dyn Provider>>) -> Self {
        providers.sort_by_key(|p| p.priority());
        Self { providers }
    }

    pub fn providers(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    fn enabled<'a>(&'a self, config: &'a Properties) -> impl Iterator<Item = &'a Arc<dyn Provider>> {
        self.providers.iter().filter(move |p| p.is_enabled(config))
    }

    /// Distinct union, in discovery order, of every enabled provider's
    /// resolvable names.
    pub fn resolvable_properties(
        &self,
        entries: &PropertyEntries,
        config: &Properties,
    ) -> Vec<String> {
        let config = sanitize_config(config);
        distinct(
            self.enabled(&config)
                .flat_map(|p| p.resolvable_properties(entries, &config)),
        )
    }

    /// Distinct union of the entry groups every provider needs.
    pub fn required_property_entries(&self) -> Vec<String> {
        distinct(self.providers.iter().flat_map(|p| p.required_property_entries()))
    }

    /// Distinct union of the properties providers need before
    /// `expression` can be resolved.
    pub fn required_properties(&self, expression: &str) -> Vec<String> {
        distinct(
            self.providers
                .iter()
                .flat_map(|p| p.required_properties(expression)),
        )
    }

    /// Resolve `name` with `properties` as the already known values and
    /// `config` as the raw test-resources configuration. Known values
    /// take precedence over configuration when a required property is
    /// looked up.
    pub fn resolve(
        &self,
        name: &str,
        properties: &Properties,
        config: &Properties,
    ) -> Result<Option<String>, ResolveError> {
        let config = sanitize_config(config);
        let env = MapEnvironment::layered(&config, properties);
        self.resolve_with(name, &env, &config)
    }

    fn resolve_with(
        &self,
        name: &str,
        env: &dyn PropertyEnvironment,
        config: &Properties,
    ) -> Result<Option<String>, ResolveError> {
        let entries: PropertyEntries = self
            .required_property_entries()
            .into_iter()
            .map(|group| {
                let members = env.property_entries(&group);
                (group, members)
            })
            .collect();
        let mut stack = Vec::new();
        let resolution = Resolution {
            engine: self,
            env,
            config,
            entries: &entries,
        };
        let result = resolution.resolve(name, &mut stack)?;
        match &result {
            Some(_) => tracing::debug!(property = name, "resolved"),
            None => tracing::debug!(property = name, "no provider answered"),
        }
        Ok(result)
    }
}

/// Per-request resolution context.
struct Resolution<'a> {
    engine: &'a ResolutionEngine,
    env: &'a dyn PropertyEnvironment,
    config: &'a Properties,
    entries: &'a PropertyEntries,
}

impl Resolution<'_> {
    fn resolve(&self, name: &str, stack: &mut Vec<String>) -> Result<Option<String>, ResolveError> {
        if stack.iter().any(|s| s == name) {
            let mut chain = stack.clone();
            chain.push(name.to_string());
            return Err(ResolveError::Cycle { chain });
        }
        if stack.len() >= MAX_DEPTH {
            return Err(ResolveError::TooDeep {
                property: name.to_string(),
            });
        }
        stack.push(name.to_string());
        let result = self.first_answer(name, stack);
        stack.pop();
        result
    }

    fn first_answer(
        &self,
        name: &str,
        stack: &mut Vec<String>,
    ) -> Result<Option<String>, ResolveError> {
        for provider in self.engine.enabled(self.config) {
            if !provider.can_resolve(name, self.entries, self.config) {
                continue;
            }

            let mut required = Properties::new();
            for dependency in provider.required_properties(name) {
                let value = match self.env.property(&dependency) {
                    Some(value) => Some(value),
                    None => self.resolve(&dependency, stack)?.map(Value::String),
                };
                if let Some(value) = value {
                    required.insert(dependency, value);
                }
            }

            tracing::debug!(provider = provider.name(), property = name, "trying provider");
            match provider.resolve(name, &required, self.config) {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => continue,
                Err(source) => {
                    return Err(ResolveError::Provider {
                        provider: provider.name().to_string(),
                        property: name.to_string(),
                        source,
                    });
                }
            }
        }
        Ok(None)
    }
}

/// Strip the legacy `test-resources.` prefix from configuration keys.
pub fn sanitize_config(config: &Properties) -> Properties {
    config
        .iter()
        .map(|(key, value)| match key.strip_prefix(CONFIG_PREFIX) {
            Some(stripped) => {
                tracing::warn!(
                    key = %key,
                    "configuration key carries the {CONFIG_PREFIX:?} prefix, use {stripped:?} instead"
                );
                (stripped.to_string(), value.clone())
            }
            None => (key.clone(), value.clone()),
        })
        .collect()
}

fn distinct(names: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in names {
        if !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Records `resolve` calls into a shared log.
    struct Scripted {
        name: &'static str,
        priority: i32,
        answers: Vec<(&'static str, Option<&'static str>)>,
        requires: Vec<(&'static str, &'static str)>,
        entries: Vec<&'static str>,
        calls: Arc<Mutex<Vec<(String, String, Properties)>>>,
    }

    impl Scripted {
        fn new(name: &'static str, calls: &Arc<Mutex<Vec<(String, String, Properties)>>>) -> Self {
            Self {
                name,
                priority: 0,
                answers: Vec::new(),
                requires: Vec::new(),
                entries: Vec::new(),
                calls: calls.clone(),
            }
        }

        fn answers(mut self, property: &'static str, value: Option<&'static str>) -> Self {
            self.answers.push((property, value));
            self
        }

        fn requires(mut self, property: &'static str, dependency: &'static str) -> Self {
            self.requires.push((property, dependency));
            self
        }

        fn priority(mut self, priority: i32) -> Self {
            self.priority = priority;
            self
        }
    }

    impl Provider for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn resolvable_properties(&self, _: &PropertyEntries, _: &Properties) -> Vec<String> {
            self.answers.iter().map(|(p, _)| p.to_string()).collect()
        }

        fn required_property_entries(&self) -> Vec<String> {
            self.entries.iter().map(|e| e.to_string()).collect()
        }

        fn required_properties(&self, expression: &str) -> Vec<String> {
            self.requires
                .iter()
                .filter(|(p, _)| *p == expression)
                .map(|(_, d)| d.to_string())
                .collect()
        }

        fn resolve(
            &self,
            name: &str,
            properties: &Properties,
            _: &Properties,
        ) -> Result<Option<String>, ProviderError> {
            self.calls.lock().unwrap().push((
                self.name.to_string(),
                name.to_string(),
                properties.clone(),
            ));
            Ok(self
                .answers
                .iter()
                .find(|(p, _)| *p == name)
                .and_then(|(_, v)| v.map(str::to_string)))
        }
    }

    struct Failing;

    impl Provider for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn resolvable_properties(&self, _: &PropertyEntries, _: &Properties) -> Vec<String> {
            vec!["db.url".into()]
        }

        fn resolve(&self, _: &str, _: &Properties, _: &Properties) -> Result<Option<String>, ProviderError> {
            Err(ProviderError::Unavailable("container exited".into()))
        }
    }

    fn log() -> Arc<Mutex<Vec<(String, String, Properties)>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn consulted(calls: &Arc<Mutex<Vec<(String, String, Properties)>>>) -> Vec<String> {
        calls.lock().unwrap().iter().map(|(p, _, _)| p.clone()).collect()
    }

    #[test]
    fn first_match_wins_in_priority_order() {
        let calls = log();
        let engine = ResolutionEngine::new(vec![
            Arc::new(Scripted::new("p2", &calls).answers("k", Some("v")).priority(10)),
            Arc::new(Scripted::new("p1", &calls).answers("k", None).priority(1)),
            Arc::new(Scripted::new("p3", &calls).answers("k", Some("late")).priority(20)),
        ]);

        let value = engine.resolve("k", &Properties::new(), &Properties::new()).unwrap();
        assert_eq!(value.as_deref(), Some("v"));
        assert_eq!(consulted(&calls), vec!["p1", "p2"]);
    }

    #[test]
    fn ties_keep_registration_order() {
        let calls = log();
        let engine = ResolutionEngine::new(vec![
            Arc::new(Scripted::new("a", &calls).answers("k", None)),
            Arc::new(Scripted::new("b", &calls).answers("k", None)),
        ]);
        assert_eq!(engine.resolve("k", &Properties::new(), &Properties::new()).unwrap(), None);
        assert_eq!(consulted(&calls), vec!["a", "b"]);
    }

    #[test]
    fn unknown_property_is_not_an_error() {
        let calls = log();
        let engine = ResolutionEngine::new(vec![Arc::new(
            Scripted::new("a", &calls).answers("k", Some("v")),
        )]);
        assert_eq!(
            engine.resolve("other", &Properties::new(), &Properties::new()).unwrap(),
            None
        );
        // Not advertised, so never consulted.
        assert!(consulted(&calls).is_empty());
    }

    #[test]
    fn required_property_chaining_from_config() {
        let calls = log();
        let engine = ResolutionEngine::new(vec![Arc::new(
            Scripted::new("jdbc", &calls)
                .answers("db.default.url", Some("jdbc:postgresql://localhost/test"))
                .requires("db.default.url", "db.default.dialect"),
        )]);
        let mut config = Properties::new();
        config.insert("db.default.dialect".into(), Value::from("postgres"));

        let value = engine.resolve("db.default.url", &Properties::new(), &config).unwrap();
        assert_eq!(value.as_deref(), Some("jdbc:postgresql://localhost/test"));

        let calls = calls.lock().unwrap();
        let (_, property, passed) = &calls[0];
        assert_eq!(property, "db.default.url");
        let mut expected = Properties::new();
        expected.insert("db.default.dialect".into(), Value::from("postgres"));
        assert_eq!(passed, &expected);
    }

    #[test]
    fn required_property_resolved_through_engine() {
        let calls = log();
        let engine = ResolutionEngine::new(vec![
            Arc::new(
                Scripted::new("url", &calls)
                    .answers("db.url", Some("pg://h"))
                    .requires("db.url", "db.dialect"),
            ),
            Arc::new(Scripted::new("dialect", &calls).answers("db.dialect", Some("postgres"))),
        ]);

        engine.resolve("db.url", &Properties::new(), &Properties::new()).unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].0, "dialect");
        assert_eq!(calls[1].0, "url");
        assert_eq!(calls[1].2.get("db.dialect"), Some(&Value::from("postgres")));
    }

    #[test]
    fn known_properties_override_config() {
        let calls = log();
        let engine = ResolutionEngine::new(vec![Arc::new(
            Scripted::new("p", &calls)
                .answers("x", Some("v"))
                .requires("x", "dep"),
        )]);
        let mut properties = Properties::new();
        properties.insert("dep".into(), Value::from("known"));
        let mut config = Properties::new();
        config.insert("dep".into(), Value::from("config"));

        engine.resolve("x", &properties, &config).unwrap();
        assert_eq!(
            calls.lock().unwrap()[0].2.get("dep"),
            Some(&Value::from("known"))
        );
    }

    #[test]
    fn cyclic_requirements_are_reported() {
        let calls = log();
        let engine = ResolutionEngine::new(vec![Arc::new(
            Scripted::new("loop", &calls)
                .answers("a", Some("1"))
                .answers("b", Some("2"))
                .requires("a", "b")
                .requires("b", "a"),
        )]);

        let err = engine.resolve("a", &Properties::new(), &Properties::new()).unwrap_err();
        match err {
            ResolveError::Cycle { chain } => assert_eq!(chain, vec!["a", "b", "a"]),
            other => panic!("expected cycle, got {other:?}"),
        }
        assert!(consulted(&calls).is_empty());
    }

    /// Answers `link.<n>` for every `n` up to `len`, each requiring the next.
    struct Chain {
        len: usize,
    }

    impl Provider for Chain {
        fn name(&self) -> &str {
            "chain"
        }

        fn resolvable_properties(&self, _: &PropertyEntries, _: &Properties) -> Vec<String> {
            (0..=self.len).map(|n| format!("link.{n}")).collect()
        }

        fn required_properties(&self, expression: &str) -> Vec<String> {
            match expression.strip_prefix("link.").and_then(|n| n.parse::<usize>().ok()) {
                Some(n) if n < self.len => vec![format!("link.{}", n + 1)],
                _ => Vec::new(),
            }
        }

        fn resolve(&self, name: &str, _: &Properties, _: &Properties) -> Result<Option<String>, ProviderError> {
            Ok(Some(name.to_string()))
        }
    }

    #[test]
    fn requirement_chain_at_depth_limit_resolves() {
        let engine = ResolutionEngine::new(vec![Arc::new(Chain { len: MAX_DEPTH - 1 })]);
        let value = engine
            .resolve("link.0", &Properties::new(), &Properties::new())
            .unwrap();
        assert_eq!(value.as_deref(), Some("link.0"));
    }

    #[test]
    fn requirement_chain_past_depth_limit_is_rejected() {
        let engine = ResolutionEngine::new(vec![Arc::new(Chain { len: MAX_DEPTH + 4 })]);
        let err = engine
            .resolve("link.0", &Properties::new(), &Properties::new())
            .unwrap_err();
        match err {
            ResolveError::TooDeep { property } => {
                assert_eq!(property, format!("link.{MAX_DEPTH}"));
            }
            other => panic!("expected depth error, got {other:?}"),
        }
    }

    #[test]
    fn disabled_provider_is_skipped() {
        let calls = log();
        let engine = ResolutionEngine::new(vec![
            Arc::new(Scripted::new("off", &calls).answers("k", Some("off"))),
            Arc::new(Scripted::new("on", &calls).answers("k", Some("on"))),
        ]);
        let mut config = Properties::new();
        config.insert("off.enabled".into(), Value::Bool(false));

        let value = engine.resolve("k", &Properties::new(), &config).unwrap();
        assert_eq!(value.as_deref(), Some("on"));
        assert_eq!(
            engine.resolvable_properties(&PropertyEntries::new(), &config),
            vec!["k"]
        );
    }

    #[test]
    fn legacy_prefixed_config_is_sanitized() {
        let calls = log();
        let engine = ResolutionEngine::new(vec![
            Arc::new(Scripted::new("off", &calls).answers("k", Some("off"))),
            Arc::new(Scripted::new("on", &calls).answers("k", Some("on"))),
        ]);
        let mut config = Properties::new();
        config.insert("test-resources.off.enabled".into(), Value::from("false"));

        let value = engine.resolve("k", &Properties::new(), &config).unwrap();
        assert_eq!(value.as_deref(), Some("on"));
    }

    #[test]
    fn provider_failure_is_propagated() {
        let calls = log();
        let engine = ResolutionEngine::new(vec![
            Arc::new(Failing),
            Arc::new(Scripted::new("later", &calls).answers("db.url", Some("v"))),
        ]);
        let err = engine
            .resolve("db.url", &Properties::new(), &Properties::new())
            .unwrap_err();
        assert!(matches!(err, ResolveError::Provider { ref provider, .. } if provider == "failing"));
        assert!(consulted(&calls).is_empty());
    }

    #[test]
    fn listing_is_distinct_union_in_discovery_order() {
        let calls = log();
        let mut a = Scripted::new("a", &calls)
            .answers("x", None)
            .answers("y", None)
            .requires("x", "scope")
            .requires("x", "dialect");
        a.entries = vec!["datasources"];
        let mut b = Scripted::new("b", &calls)
            .answers("y", None)
            .answers("z", None)
            .requires("x", "dialect");
        b.entries = vec!["datasources", "servers"];
        let engine = ResolutionEngine::new(vec![Arc::new(a), Arc::new(b)]);

        assert_eq!(
            engine.resolvable_properties(&PropertyEntries::new(), &Properties::new()),
            vec!["x", "y", "z"]
        );
        assert_eq!(engine.required_property_entries(), vec!["datasources", "servers"]);
        assert_eq!(engine.required_properties("x"), vec!["scope", "dialect"]);
        assert!(engine.required_properties("unknown").is_empty());
    }
}
