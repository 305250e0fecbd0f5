use crate::config::ConfigErrors;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::{
    collections::{btree_map, BTreeMap},
    fmt,
    fs,
    path::Path,
};
use thiserror::Error;
use tracing::{debug, error};

/// Message reported for any invalid override, regardless of which key failed.
pub const INVALID_OVERRIDES: &str = "override_args are invalid, aborting.";

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("override_args are invalid, aborting.")]
pub struct InvalidOverrideError;

/// A scalar value assigned to a single config path
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum OverrideValue {
    Null,
    Bool(bool),
    Integer(i64),
    /// above `i64::MAX`
    Unsigned(u64),
    Float(f64),
    String(String),
}

impl fmt::Display for OverrideValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Unsigned(value) => write!(f, "{value}"),
            // keep floats distinguishable from integers once rendered
            Self::Float(value) if value.is_finite() && value.fract() == 0.0 => {
                write!(f, "{value:.1}")
            }
            Self::Float(value) => write!(f, "{value}"),
            Self::String(value) => f.write_str(&quote_if_needed(value)),
        }
    }
}

/// Quote a string value for the override grammar of the job entrypoint.
/// Plain identifiers, paths and model names are left untouched.
fn quote_if_needed(value: &str) -> String {
    let is_plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:@".contains(c));

    if is_plain {
        value.to_owned()
    } else {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
    }
}

impl From<bool> for OverrideValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for OverrideValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for OverrideValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for OverrideValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for OverrideValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// Dotted config path -> value overrides for a single run.
/// Keys are kept sorted so the rendered form does not depend on insertion order.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct OverrideSet(BTreeMap<String, OverrideValue>);

impl OverrideSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, value: impl Into<OverrideValue>) {
        self.0.insert(path.into(), value.into());
    }

    pub fn get(&self, path: &str) -> Option<&OverrideValue> {
        self.0.get(path)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, OverrideValue> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `path=value` arguments in key order
    pub fn to_args(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|(path, value)| format!("{path}={value}"))
            .collect()
    }
}

impl<K: Into<String>, V: Into<OverrideValue>> FromIterator<(K, V)> for OverrideSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(path, value)| (path.into(), value.into()))
                .collect(),
        )
    }
}

/// Read-only view of the experiment config schema.
pub trait ConfigSchema {
    /// true iff `path` addresses a leaf, i.e. not a missing key and not a nested section
    fn has_path(&self, path: &str) -> bool;
}

/// Schema backed by a fully resolved YAML config, every non-mapping node is a leaf.
#[derive(Debug, Clone)]
pub struct YamlSchema {
    root: Value,
}

impl YamlSchema {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content =
            fs::read_to_string(path).map_err(|error| ConfigErrors::Io(path.to_owned(), error))?;
        let schema = Self::parse(&content)?;

        debug!(path = ?path, "Loaded config schema");

        Ok(schema)
    }

    pub fn parse(content: &str) -> Result<Self, serde_yaml::Error> {
        Ok(Self {
            root: serde_yaml::from_str(content)?,
        })
    }
}

impl ConfigSchema for YamlSchema {
    fn has_path(&self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }

        let mut node = &self.root;

        for segment in path.split('.') {
            match node {
                Value::Mapping(mapping) => match mapping.get(segment) {
                    Some(child) => node = child,
                    None => return false,
                },
                _ => return false,
            }
        }

        !node.is_mapping()
    }
}

/// Check every key of every override set against the schema.
/// Stops at the first unresolvable key, the whole batch is rejected.
pub fn validate<S: ConfigSchema + ?Sized>(
    overrides: &[OverrideSet],
    schema: &S,
) -> Result<(), InvalidOverrideError> {
    let invalid = overrides
        .iter()
        .enumerate()
        .flat_map(|(index, set)| set.keys().map(move |key| (index, key)))
        .find(|(_, key)| !schema.has_path(key));

    match invalid {
        Some((index, key)) => {
            error!(run = index, key = key, "Override does not address a leaf of the config schema");

            Err(InvalidOverrideError)
        }
        None => Ok(()),
    }
}
