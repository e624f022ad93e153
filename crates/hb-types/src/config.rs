//! Configurations, their identifiers, and hyperparameter values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Resource amount for one evaluation (epochs, data fraction, ...).
pub type Budget = f64;

/// Identifies a configuration for the lifetime of a session.
///
/// Assigned when the configuration is sampled; serialized as
/// `[iteration, bracket, sequence]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "[usize; 3]", into = "[usize; 3]")]
pub struct ConfigId {
    /// Full bracket cycle this configuration was sampled in.
    pub iteration: usize,
    /// Bracket index `s` within the cycle.
    pub bracket: usize,
    /// Position within the bracket's initial population.
    pub sequence: usize,
}

impl ConfigId {
    pub fn new(iteration: usize, bracket: usize, sequence: usize) -> Self {
        Self {
            iteration,
            bracket,
            sequence,
        }
    }
}

impl From<[usize; 3]> for ConfigId {
    fn from(parts: [usize; 3]) -> Self {
        Self::new(parts[0], parts[1], parts[2])
    }
}

impl From<ConfigId> for [usize; 3] {
    fn from(id: ConfigId) -> Self {
        [id.iteration, id.bracket, id.sequence]
    }
}

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.iteration, self.bracket, self.sequence)
    }
}

/// A concrete hyperparameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParameterValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Str(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// An immutable assignment of values to the active hyperparameters of a space.
///
/// Keys are ordered so logs and wire messages are stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration(BTreeMap<String, ParameterValue>);

impl Configuration {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParameterValue) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterValue)> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl FromIterator<(String, ParameterValue)> for Configuration {
    fn from_iter<I: IntoIterator<Item = (String, ParameterValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}: {value}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_id_serializes_as_triple() {
        let id = ConfigId::new(1, 3, 7);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "[1,3,7]");

        let back: ConfigId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert_eq!(id.to_string(), "(1, 3, 7)");
    }

    #[test]
    fn config_ids_order_by_iteration_then_bracket() {
        let mut ids = vec![
            ConfigId::new(1, 0, 0),
            ConfigId::new(0, 3, 2),
            ConfigId::new(0, 3, 1),
        ];
        ids.sort();
        assert_eq!(ids[0], ConfigId::new(0, 3, 1));
        assert_eq!(ids[2], ConfigId::new(1, 0, 0));
    }

    #[test]
    fn parameter_values_keep_their_kind_through_json() {
        let config = Configuration::new()
            .with("layers", 3i64)
            .with("lr", 1.0)
            .with("optimizer", "adam");

        let json = serde_json::to_string(&config).unwrap();
        let back: Configuration = serde_json::from_str(&json).unwrap();

        assert_eq!(back.get("layers"), Some(&ParameterValue::Int(3)));
        assert_eq!(back.get("lr"), Some(&ParameterValue::Float(1.0)));
        assert_eq!(back.get("optimizer").and_then(|v| v.as_str()), Some("adam"));
    }

    #[test]
    fn configuration_display_is_sorted() {
        let config = Configuration::new().with("w", 1i64).with("b", 0.5);
        assert_eq!(config.to_string(), "{b: 0.5, w: 1}");
    }
}
