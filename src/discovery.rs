use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::client::GoogleClient;
use crate::error::GapiError;

/// A parsed Discovery REST description. Read-only once loaded.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Api {
    pub base_url: String,
    pub name: String,
    pub version: String,
    pub title: String,
    pub description: String,
    pub documentation_link: String,
    pub resources: BTreeMap<String, Resource>,
    pub methods: BTreeMap<String, Method>,
    pub parameters: BTreeMap<String, Parameter>,
    pub schemas: BTreeMap<String, Schema>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Resource {
    pub resources: BTreeMap<String, Resource>,
    pub methods: BTreeMap<String, Method>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Method {
    pub id: String,
    pub path: String,
    pub http_method: String,
    pub description: String,
    pub parameters: BTreeMap<String, Parameter>,
    /// Empty when the method needs no authorization.
    pub scopes: Vec<String>,
    pub request: Option<SchemaRef>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SchemaRef {
    #[serde(rename = "$ref")]
    pub reference: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Parameter {
    #[serde(rename = "type")]
    pub kind: ValueType,
    pub description: String,
    pub location: Location,
    pub default: Option<String>,
    pub required: bool,
}

/// Request body shape; only top-level properties are used.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Schema {
    pub properties: BTreeMap<String, Property>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Property {
    #[serde(rename = "type")]
    pub kind: ValueType,
    pub description: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Boolean,
    Integer,
    Number,
    Object,
    Array,
    Any,
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::String => "string",
            ValueType::Boolean => "boolean",
            ValueType::Integer => "integer",
            ValueType::Number => "number",
            ValueType::Object => "object",
            ValueType::Array => "array",
            ValueType::Any => "any",
            ValueType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Path,
    Query,
    #[default]
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Directory {
    pub items: Vec<DirectoryItem>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DirectoryItem {
    pub name: String,
    pub version: String,
    pub description: String,
}

impl Api {
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.methods.is_empty()
    }

    /// Method name as typed on the command line: the id without the `<api>.` prefix.
    pub fn relative_name<'a>(&self, method: &'a Method) -> &'a str {
        method
            .id
            .strip_prefix(&self.name)
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or(&method.id)
    }

    /// Every method in the API, top-level ones first, then resources depth-first.
    pub fn all_methods(&self) -> Vec<&Method> {
        fn walk<'a>(resources: &'a BTreeMap<String, Resource>, out: &mut Vec<&'a Method>) {
            for resource in resources.values() {
                out.extend(resource.methods.values());
                walk(&resource.resources, out);
            }
        }

        let mut out: Vec<&Method> = self.methods.values().collect();
        walk(&self.resources, &mut out);
        out
    }

    /// API-level parameters with the method's own definitions layered on top.
    pub fn merged_parameters<'a>(&'a self, method: &'a Method) -> BTreeMap<&'a str, &'a Parameter> {
        let mut merged: BTreeMap<&str, &Parameter> = self
            .parameters
            .iter()
            .map(|(name, param)| (name.as_str(), param))
            .collect();
        for (name, param) in &method.parameters {
            merged.insert(name.as_str(), param);
        }
        merged
    }

    pub fn request_schema(&self, method: &Method) -> Option<&Schema> {
        method
            .request
            .as_ref()
            .and_then(|r| self.schemas.get(&r.reference))
    }
}

/// Splits `name` or `name:version`.
pub fn parse_identifier(identifier: &str) -> (&str, Option<&str>) {
    match identifier.split_once(':') {
        Some((name, version)) if !version.is_empty() => (name, Some(version)),
        Some((name, _)) => (name, None),
        None => (identifier, None),
    }
}

pub fn list_directory(client: &GoogleClient) -> Result<Vec<DirectoryItem>> {
    let directory: Directory = client.get_json("discovery/v1/apis")?;
    Ok(directory.items)
}

pub fn preferred_version(client: &GoogleClient, name: &str) -> Result<String> {
    let path = format!(
        "discovery/v1/apis?preferred=true&name={}&fields=items/version",
        urlencoding::encode(name)
    );
    let directory: Directory = client.get_json(&path)?;
    directory
        .items
        .into_iter()
        .next()
        .map(|item| item.version)
        .ok_or_else(|| GapiError::ApiNotFound(name.to_string()).into())
}

pub fn load_api(client: &GoogleClient, identifier: &str) -> Result<Api> {
    let (name, version) = parse_identifier(identifier);
    let version = match version {
        Some(v) => v.to_string(),
        None => {
            let v = preferred_version(client, name)?;
            log::debug!("preferred version of {} is {}", name, v);
            v
        }
    };

    let api: Api = client.get_json(&format!(
        "discovery/v1/apis/{}/{}/rest",
        urlencoding::encode(name),
        urlencoding::encode(&version)
    ))?;
    if api.is_empty() {
        return Err(GapiError::EmptyApi(identifier.to_string()).into());
    }
    Ok(api)
}

/// Resolves `resource.sub.method` by walking the resource tree.
pub fn find_method<'a>(dotted: &str, api: &'a Api) -> Result<&'a Method, GapiError> {
    let not_found = || GapiError::MethodNotFound(dotted.to_string());

    let mut parts: Vec<&str> = dotted.split('.').collect();
    let last = parts.pop().filter(|s| !s.is_empty()).ok_or_else(not_found)?;

    let mut resources = &api.resources;
    let mut methods = &api.methods;
    for part in parts {
        let resource = resources.get(part).ok_or_else(not_found)?;
        resources = &resource.resources;
        methods = &resource.methods;
    }
    methods.get(last).ok_or_else(not_found)
}
