use anyhow::{Context, Result};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::PathBuf;

use crate::discovery::{Api, Location, Method, ValueType};
use crate::error::GapiError;

pub const BODY_FLAG_PREFIX: &str = "res.";

/// Flag values supplied for one invocation, keyed by flag name without dashes.
pub type FlagValues = BTreeMap<String, String>;

/// Where the request body comes from when it is not assembled from `res.*` flags.
#[derive(Debug, Default, Clone)]
pub struct BodyInput {
    pub in_file: Option<PathBuf>,
    pub from_stdin: bool,
}

fn provided<'a>(values: &'a FlagValues, name: &str) -> Option<&'a str> {
    values.get(name).map(String::as_str).filter(|v| !v.is_empty())
}

/// Builds the request URL from the method's path template.
///
/// Path parameters are substituted first, then query parameters are
/// appended in name order. A required path parameter without a value is an
/// error; nothing is sent in that case.
pub fn bind_url(api: &Api, method: &Method, values: &FlagValues) -> Result<String, GapiError> {
    let params = api.merged_parameters(method);
    let mut url = format!("{}{}", api.base_url, method.path);

    for (name, param) in params.iter().filter(|(_, p)| p.location == Location::Path) {
        let Some(value) = provided(values, name) else {
            if param.required {
                return Err(GapiError::MissingParameter(name.to_string()));
            }
            continue;
        };
        url = url.replace(&format!("{{{}}}", name), &urlencoding::encode(value));
        url = url.replace(&format!("{{+{}}}", name), value);
    }

    for (name, _) in params.iter().filter(|(_, p)| p.location == Location::Query) {
        let Some(value) = provided(values, name) else {
            continue;
        };
        let delim = if url.contains('?') { '&' } else { '?' };
        url.push(delim);
        url.push_str(&urlencoding::encode(name));
        url.push('=');
        url.push_str(&urlencoding::encode(value));
    }

    Ok(url)
}

/// Produces the request body: `--meta.inFile` wins over `--meta.in`, which
/// wins over individual `--res.<property>` flags.
pub fn build_body(
    api: &Api,
    method: &Method,
    values: &FlagValues,
    input: &BodyInput,
    stdin: &mut impl Read,
) -> Result<Option<Vec<u8>>> {
    if let Some(path) = &input.in_file {
        let bytes =
            fs::read(path).with_context(|| format!("error opening file {}", path.display()))?;
        return Ok(Some(bytes));
    }

    if input.from_stdin {
        let mut bytes = Vec::new();
        stdin
            .read_to_end(&mut bytes)
            .context("error reading from stdin")?;
        return Ok(Some(bytes));
    }

    let Some(schema) = api.request_schema(method) else {
        return Ok(None);
    };

    let mut body = Map::new();
    for (name, property) in &schema.properties {
        let flag = format!("{BODY_FLAG_PREFIX}{name}");
        let Some(raw) = provided(values, &flag) else {
            continue;
        };
        body.insert(name.clone(), coerce(property.kind, raw)?);
    }

    if body.is_empty() {
        return Ok(None);
    }
    let bytes = serde_json::to_vec(&Value::Object(body)).context("error marshalling JSON")?;
    Ok(Some(bytes))
}

/// Converts a flag string into the JSON value the schema declares.
pub fn coerce(kind: ValueType, raw: &str) -> Result<Value, GapiError> {
    let fail = || GapiError::Conversion {
        value: raw.to_string(),
        kind: kind.to_string(),
    };

    match kind {
        ValueType::String => Ok(Value::String(raw.to_string())),
        ValueType::Boolean => Ok(Value::Bool(raw == "true")),
        ValueType::Integer => raw
            .parse::<i64>()
            .map(|v| Value::Number(v.into()))
            .map_err(|_| fail()),
        ValueType::Number => raw
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(fail),
        _ => Err(fail()),
    }
}
