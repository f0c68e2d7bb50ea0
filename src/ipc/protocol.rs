//! Request and response shapes carried over the HTTP surface.
//!
//! Bodies are single codec [`Value`]s. Requests are maps with fixed
//! keys; responses are plain values wrapped in a result marker by the
//! transport.

use std::collections::BTreeMap;

use serde::Serialize;

use super::codec::Value;
use crate::resolver::{Properties, PropertyEntries};

/// Content type of every request and response body.
pub const CONTENT_TYPE: &str = "application/x-test-resources+binary";

/// Header carrying the server access token.
pub const ACCESS_TOKEN_HEADER: &str = "Access-Token";

pub const PATH_LIST: &str = "/list";
pub const PATH_REQUIRED_ENTRIES: &str = "/requirements/entries";
pub const PATH_REQUIRED_EXPR: &str = "/requirements/expr";
pub const PATH_RESOLVE: &str = "/resolve";
pub const PATH_CLOSE_ALL: &str = "/close/all";
pub const PATH_CLOSE: &str = "/close";
pub const PATH_RESOURCES: &str = "/testcontainers";
pub const PATH_STOP: &str = "/stop";

/// Protocol decoding error type.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("missing field {0:?}")]
    MissingField(&'static str),
    #[error("field {field:?}: expected {expected}, got {actual}")]
    UnexpectedKind {
        field: &'static str,
        expected: &'static str,
        actual: &'static str,
    },
}

/// `POST /resolve` body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolveRequest {
    pub name: String,
    /// Already resolved required properties.
    pub properties: Properties,
    /// Raw test-resources configuration.
    pub config: Properties,
}

impl ResolveRequest {
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert(Value::from("name"), Value::from(self.name.as_str()));
        map.insert(Value::from("properties"), self.properties.clone().into());
        map.insert(Value::from("config"), self.config.clone().into());
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let map = expect_map("body", value)?;
        let name = match map.get(&Value::from("name")) {
            Some(Value::String(name)) => name.clone(),
            Some(other) => return Err(unexpected("name", "string", other)),
            None => return Err(ProtocolError::MissingField("name")),
        };
        Ok(Self {
            name,
            properties: optional_properties("properties", map)?,
            config: optional_properties("config", map)?,
        })
    }
}

/// `POST /list` body. `GET /list` is equivalent to an empty request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListRequest {
    pub property_entries: PropertyEntries,
    pub config: Properties,
}

impl ListRequest {
    pub fn to_value(&self) -> Value {
        let entries: BTreeMap<String, Value> = self
            .property_entries
            .iter()
            .map(|(group, members)| (group.clone(), Value::from(members.clone())))
            .collect();
        let mut map = BTreeMap::new();
        map.insert(Value::from("propertyEntries"), entries.into());
        map.insert(Value::from("config"), self.config.clone().into());
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let map = expect_map("body", value)?;
        let mut property_entries = PropertyEntries::new();
        match map.get(&Value::from("propertyEntries")) {
            None | Some(Value::Null) => {}
            Some(Value::Map(groups)) => {
                for (group, members) in groups {
                    let group = expect_str("propertyEntries", group)?;
                    property_entries
                        .insert(group.to_string(), string_list("propertyEntries", members)?);
                }
            }
            Some(other) => return Err(unexpected("propertyEntries", "map", other)),
        }
        Ok(Self {
            property_entries,
            config: optional_properties("config", map)?,
        })
    }
}

/// A live resource as reported by `GET /testcontainers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub name: String,
    pub image_name: String,
    pub id: String,
    pub scope: String,
}

impl ResourceDescriptor {
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert(Value::from("name"), Value::from(self.name.as_str()));
        map.insert(Value::from("imageName"), Value::from(self.image_name.as_str()));
        map.insert(Value::from("id"), Value::from(self.id.as_str()));
        map.insert(Value::from("scope"), Value::from(self.scope.as_str()));
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let map = expect_map("resource", value)?;
        let field = |key: &'static str| -> Result<String, ProtocolError> {
            match map.get(&Value::from(key)) {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(Value::Null) | None => Ok(String::new()),
                Some(other) => Err(unexpected(key, "string", other)),
            }
        };
        Ok(Self {
            name: field("name")?,
            image_name: field("imageName")?,
            id: field("id")?,
            scope: field("scope")?,
        })
    }
}

/// Decode a list of strings, as returned by the listing endpoints.
pub fn string_list(field: &'static str, value: &Value) -> Result<Vec<String>, ProtocolError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::List(items) => items
            .iter()
            .map(|item| expect_str(field, item).map(str::to_string))
            .collect(),
        other => Err(unexpected(field, "list", other)),
    }
}

/// Decode an optional string, as returned by `POST /resolve`.
pub fn optional_string(field: &'static str, value: &Value) -> Result<Option<String>, ProtocolError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        other => Err(unexpected(field, "string", other)),
    }
}

/// Decode a boolean, as returned by the close endpoints.
pub fn boolean(field: &'static str, value: &Value) -> Result<bool, ProtocolError> {
    value
        .as_bool()
        .ok_or_else(|| unexpected(field, "boolean", value))
}

/// Decode a string-keyed map into properties.
pub fn properties(field: &'static str, value: &Value) -> Result<Properties, ProtocolError> {
    match value {
        Value::Null => Ok(Properties::new()),
        Value::Map(map) => map
            .iter()
            .map(|(k, v)| Ok((expect_str(field, k)?.to_string(), v.clone())))
            .collect(),
        other => Err(unexpected(field, "map", other)),
    }
}

fn optional_properties(
    field: &'static str,
    map: &BTreeMap<Value, Value>,
) -> Result<Properties, ProtocolError> {
    match map.get(&Value::from(field)) {
        Some(value) => properties(field, value),
        None => Ok(Properties::new()),
    }
}

fn expect_map<'a>(
    field: &'static str,
    value: &'a Value,
) -> Result<&'a BTreeMap<Value, Value>, ProtocolError> {
    value.as_map().ok_or_else(|| unexpected(field, "map", value))
}

fn expect_str<'a>(field: &'static str, value: &'a Value) -> Result<&'a str, ProtocolError> {
    value.as_str().ok_or_else(|| unexpected(field, "string", value))
}

fn unexpected(field: &'static str, expected: &'static str, actual: &Value) -> ProtocolError {
    ProtocolError::UnexpectedKind {
        field,
        expected,
        actual: actual.kind(),
    }
}
