//! JSON search space documents.
//!
//! The layout follows the widely used ConfigSpace JSON schema:
//! a `hyperparameters` array of objects tagged by `type`, a `conditions`
//! array (`EQ` / `IN`), and an (unsupported, must be empty) `forbiddens` array.

use hb_types::{ParameterValue, SpaceError};
use serde::{Deserialize, Serialize};

use crate::space::{Condition, ConditionKind, Hyperparameter, HyperparameterKind, SearchSpace};

const FORMAT_VERSION: f64 = 0.2;

fn format_version() -> f64 {
    FORMAT_VERSION
}

#[derive(Debug, Serialize, Deserialize)]
struct SpaceDocument {
    hyperparameters: Vec<HyperparameterDoc>,
    #[serde(default)]
    conditions: Vec<ConditionDoc>,
    #[serde(default)]
    forbiddens: Vec<serde_json::Value>,
    #[serde(default = "format_version")]
    json_format_version: f64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HyperparameterDoc {
    UniformFloat {
        name: String,
        lower: f64,
        upper: f64,
        #[serde(default)]
        log: bool,
        #[serde(default, alias = "default_value", skip_serializing_if = "Option::is_none")]
        default: Option<f64>,
    },
    UniformInt {
        name: String,
        lower: i64,
        upper: i64,
        #[serde(default)]
        log: bool,
        #[serde(default, alias = "default_value", skip_serializing_if = "Option::is_none")]
        default: Option<i64>,
    },
    Categorical {
        name: String,
        choices: Vec<ParameterValue>,
        #[serde(default, alias = "default_value", skip_serializing_if = "Option::is_none")]
        default: Option<ParameterValue>,
    },
    Ordinal {
        name: String,
        sequence: Vec<ParameterValue>,
        #[serde(default, alias = "default_value", skip_serializing_if = "Option::is_none")]
        default: Option<ParameterValue>,
    },
    Constant {
        name: String,
        value: ParameterValue,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum ConditionDoc {
    #[serde(rename = "EQ")]
    Equals {
        child: String,
        parent: String,
        value: ParameterValue,
    },
    #[serde(rename = "IN")]
    In {
        child: String,
        parent: String,
        values: Vec<ParameterValue>,
    },
}

impl From<HyperparameterDoc> for Hyperparameter {
    fn from(doc: HyperparameterDoc) -> Self {
        match doc {
            HyperparameterDoc::UniformFloat {
                name,
                lower,
                upper,
                log,
                default,
            } => Hyperparameter {
                name,
                kind: HyperparameterKind::Float {
                    lower,
                    upper,
                    log,
                    default,
                },
            },
            HyperparameterDoc::UniformInt {
                name,
                lower,
                upper,
                log,
                default,
            } => Hyperparameter {
                name,
                kind: HyperparameterKind::Int {
                    lower,
                    upper,
                    log,
                    default,
                },
            },
            HyperparameterDoc::Categorical {
                name,
                choices,
                default,
            } => Hyperparameter {
                name,
                kind: HyperparameterKind::Categorical { choices, default },
            },
            HyperparameterDoc::Ordinal {
                name,
                sequence,
                default,
            } => Hyperparameter {
                name,
                kind: HyperparameterKind::Ordinal { sequence, default },
            },
            // A constant is a categorical with a single choice.
            HyperparameterDoc::Constant { name, value } => Hyperparameter {
                name,
                kind: HyperparameterKind::Categorical {
                    choices: vec![value],
                    default: None,
                },
            },
        }
    }
}

impl From<&Hyperparameter> for HyperparameterDoc {
    fn from(hp: &Hyperparameter) -> Self {
        let name = hp.name.clone();
        match &hp.kind {
            HyperparameterKind::Float {
                lower,
                upper,
                log,
                default,
            } => HyperparameterDoc::UniformFloat {
                name,
                lower: *lower,
                upper: *upper,
                log: *log,
                default: *default,
            },
            HyperparameterKind::Int {
                lower,
                upper,
                log,
                default,
            } => HyperparameterDoc::UniformInt {
                name,
                lower: *lower,
                upper: *upper,
                log: *log,
                default: *default,
            },
            HyperparameterKind::Categorical { choices, default } => HyperparameterDoc::Categorical {
                name,
                choices: choices.clone(),
                default: default.clone(),
            },
            HyperparameterKind::Ordinal { sequence, default } => HyperparameterDoc::Ordinal {
                name,
                sequence: sequence.clone(),
                default: default.clone(),
            },
        }
    }
}

impl From<ConditionDoc> for Condition {
    fn from(doc: ConditionDoc) -> Self {
        match doc {
            ConditionDoc::Equals {
                child,
                parent,
                value,
            } => Condition {
                child,
                parent,
                kind: ConditionKind::Equals,
                values: vec![value],
            },
            ConditionDoc::In {
                child,
                parent,
                values,
            } => Condition {
                child,
                parent,
                kind: ConditionKind::In,
                values,
            },
        }
    }
}

impl From<&Condition> for ConditionDoc {
    fn from(cond: &Condition) -> Self {
        match (cond.kind, cond.values.as_slice()) {
            (ConditionKind::Equals, [value]) => ConditionDoc::Equals {
                child: cond.child.clone(),
                parent: cond.parent.clone(),
                value: value.clone(),
            },
            _ => ConditionDoc::In {
                child: cond.child.clone(),
                parent: cond.parent.clone(),
                values: cond.values.clone(),
            },
        }
    }
}

/// Parse a JSON document into a search space. The result is not validated.
pub fn read(text: &str) -> Result<SearchSpace, SpaceError> {
    let doc: SpaceDocument = serde_json::from_str(text).map_err(|e| SpaceError::Parse {
        line: e.line(),
        message: e.to_string(),
    })?;

    if !doc.forbiddens.is_empty() {
        return Err(SpaceError::Invalid {
            message: format!(
                "forbidden clauses are not supported ({} found)",
                doc.forbiddens.len()
            ),
        });
    }

    Ok(SearchSpace {
        hyperparameters: doc.hyperparameters.into_iter().map(Into::into).collect(),
        conditions: doc.conditions.into_iter().map(Into::into).collect(),
    })
}

/// Render a search space as a pretty-printed JSON document.
pub fn write(space: &SearchSpace) -> Result<String, SpaceError> {
    let doc = SpaceDocument {
        hyperparameters: space.hyperparameters.iter().map(Into::into).collect(),
        conditions: space.conditions.iter().map(Into::into).collect(),
        forbiddens: Vec::new(),
        json_format_version: FORMAT_VERSION,
    };
    serde_json::to_string_pretty(&doc).map_err(|e| SpaceError::Invalid {
        message: format!("cannot encode search space: {e}"),
    })
}
