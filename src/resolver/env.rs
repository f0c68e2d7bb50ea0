//! Property environment consulted during resolution.

use super::Properties;
use crate::ipc::codec::Value;

/// Source of already known configuration values and of entry group
/// members.
pub trait PropertyEnvironment: Send + Sync {
    fn property(&self, name: &str) -> Option<Value>;

    /// Member names of `group`, in first-seen order.
    fn property_entries(&self, group: &str) -> Vec<String>;
}

/// Environment over a flat property map.
///
/// Group members are the distinct segments following `<group>.` in the
/// keys (`datasources.default.url` is member `default` of
/// `datasources`), plus the keys of a map stored directly under the
/// group name.
#[derive(Debug, Clone, Default)]
pub struct MapEnvironment {
    properties: Properties,
}

impl MapEnvironment {
    pub fn new(properties: Properties) -> Self {
        Self { properties }
    }

    /// Layer `overrides` on top of `base`.
    pub fn layered(base: &Properties, overrides: &Properties) -> Self {
        let mut properties = base.clone();
        properties.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { properties }
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }
}

impl PropertyEnvironment for MapEnvironment {
    fn property(&self, name: &str) -> Option<Value> {
        self.properties.get(name).filter(|v| !v.is_null()).cloned()
    }

    fn property_entries(&self, group: &str) -> Vec<String> {
        let prefix = format!("{group}.");
        let mut members: Vec<String> = Vec::new();
        let mut push = |member: &str| {
            if !member.is_empty() && !members.iter().any(|m| m == member) {
                members.push(member.to_string());
            }
        };
        if let Some(Value::Map(map)) = self.properties.get(group) {
            for key in map.keys() {
                if let Some(key) = key.as_str() {
                    push(key);
                }
            }
        }
        for key in self.properties.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                push(rest.split('.').next().unwrap_or(rest));
            }
        }
        members
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn entries_from_flat_keys() {
        let mut props = Properties::new();
        props.insert("datasources.default.dialect".into(), Value::from("postgres"));
        props.insert("datasources.default.url".into(), Value::Null);
        props.insert("datasources.reporting.dialect".into(), Value::from("mysql"));
        props.insert("datasourcesx.other".into(), Value::Null);
        let env = MapEnvironment::new(props);

        assert_eq!(env.property_entries("datasources"), vec!["default", "reporting"]);
        assert!(env.property_entries("missing").is_empty());
    }

    #[test]
    fn entries_from_nested_map() {
        let mut nested = BTreeMap::new();
        nested.insert(Value::from("users"), Value::Map(BTreeMap::new()));
        let mut props = Properties::new();
        props.insert("mongodb.servers".into(), Value::Map(nested));
        let env = MapEnvironment::new(props);

        assert_eq!(env.property_entries("mongodb.servers"), vec!["users"]);
    }

    #[test]
    fn null_values_are_unknown() {
        let mut props = Properties::new();
        props.insert("a".into(), Value::Null);
        props.insert("b".into(), Value::from("x"));
        let env = MapEnvironment::new(props);
        assert_eq!(env.property("a"), None);
        assert_eq!(env.property("b"), Some(Value::from("x")));
    }

    #[test]
    fn layered_overrides_win() {
        let mut base = Properties::new();
        base.insert("k".into(), Value::from("base"));
        let mut top = Properties::new();
        top.insert("k".into(), Value::from("top"));
        let env = MapEnvironment::layered(&base, &top);
        assert_eq!(env.property("k"), Some(Value::from("top")));
    }
}
