//! Line-based parameter-constraint format.
//!
//! ```text
//! # comment
//! lr real [1e-05, 0.1] [0.001]log
//! layers integer [1, 8] [4]
//! optimizer categorical {adam, sgd} [adam]
//! size ordinal {small, medium, large} [small]
//! momentum real [0, 0.99] [0.9]
//! momentum | optimizer in {sgd}
//! nesterov | optimizer == sgd
//! ```
//!
//! Forbidden clauses (`{a=1, b=2}`) are not supported and fail to parse.

use hb_types::{ParameterValue, SpaceError};

use crate::space::{Condition, ConditionKind, Hyperparameter, HyperparameterKind, SearchSpace};

/// Parse `.pcs` text into a search space. The result is not validated.
pub fn read(text: &str) -> Result<SearchSpace, SpaceError> {
    let mut space = SearchSpace::new();

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('{') {
            return Err(parse_error(line_no, "forbidden clauses are not supported"));
        }

        if let Some((child, rest)) = line.split_once('|') {
            let condition = parse_condition(child.trim(), rest.trim())
                .map_err(|message| parse_error(line_no, message))?;
            space = space.add_condition(condition);
        } else {
            let hyperparameter =
                parse_hyperparameter(line).map_err(|message| parse_error(line_no, message))?;
            space = space.add(hyperparameter);
        }
    }

    Ok(space)
}

/// Render a search space as `.pcs` text. Missing defaults are filled in.
pub fn write(space: &SearchSpace) -> String {
    let mut out = String::new();

    for hp in &space.hyperparameters {
        let default = hp.kind.default_value();
        let line = match &hp.kind {
            HyperparameterKind::Float {
                lower, upper, log, ..
            } => format!(
                "{} real [{}, {}] [{}]{}",
                hp.name,
                lower,
                upper,
                default,
                if *log { "log" } else { "" }
            ),
            HyperparameterKind::Int {
                lower, upper, log, ..
            } => format!(
                "{} integer [{}, {}] [{}]{}",
                hp.name,
                lower,
                upper,
                default,
                if *log { "log" } else { "" }
            ),
            HyperparameterKind::Categorical { choices, .. } => {
                format!("{} categorical {{{}}} [{}]", hp.name, join(choices), token(&default))
            }
            HyperparameterKind::Ordinal { sequence, .. } => {
                format!("{} ordinal {{{}}} [{}]", hp.name, join(sequence), token(&default))
            }
        };
        out.push_str(&line);
        out.push('\n');
    }

    if !space.conditions.is_empty() {
        out.push('\n');
    }
    for cond in &space.conditions {
        let line = match cond.kind {
            ConditionKind::Equals if cond.values.len() == 1 => {
                format!("{} | {} == {}", cond.child, cond.parent, token(&cond.values[0]))
            }
            _ => format!("{} | {} in {{{}}}", cond.child, cond.parent, join(&cond.values)),
        };
        out.push_str(&line);
        out.push('\n');
    }

    out
}

fn join(values: &[ParameterValue]) -> String {
    values.iter().map(token).collect::<Vec<_>>().join(", ")
}

/// A value as it must appear in a list or condition so that `parse_token`
/// reads back the same variant: floats always keep a `.` or an exponent.
fn token(value: &ParameterValue) -> String {
    match value {
        ParameterValue::Float(v) => format!("{v:?}"),
        other => other.to_string(),
    }
}

fn parse_error(line: usize, message: impl Into<String>) -> SpaceError {
    SpaceError::Parse {
        line,
        message: message.into(),
    }
}

/// Integers first, then floats, otherwise a bare string.
fn parse_token(token: &str) -> ParameterValue {
    let token = token.trim();
    if let Ok(v) = token.parse::<i64>() {
        ParameterValue::Int(v)
    } else if let Ok(v) = token.parse::<f64>() {
        ParameterValue::Float(v)
    } else {
        ParameterValue::Str(token.to_string())
    }
}

/// Split `"<open>inner<close>rest"` into `(inner, rest)`.
fn take_delimited(s: &str, open: char, close: char) -> Result<(&str, &str), String> {
    let s = s.trim_start();
    let body = s
        .strip_prefix(open)
        .ok_or_else(|| format!("expected '{open}' in {s:?}"))?;
    let end = body
        .find(close)
        .ok_or_else(|| format!("missing '{close}' in {s:?}"))?;
    Ok((&body[..end], &body[end + close.len_utf8()..]))
}

fn split_list(inner: &str) -> Vec<ParameterValue> {
    inner
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(parse_token)
        .collect()
}

fn parse_f64(token: &str) -> Result<f64, String> {
    token
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("expected a number, found {:?}", token.trim()))
}

fn parse_i64(token: &str) -> Result<i64, String> {
    let token = token.trim();
    match token.parse::<i64>() {
        Ok(v) => Ok(v),
        Err(_) => match token.parse::<f64>() {
            Ok(v) if v.fract() == 0.0 => Ok(v as i64),
            _ => Err(format!("expected an integer, found {token:?}")),
        },
    }
}

/// Parse `[lower, upper] [default]log` into its parts.
fn parse_range(rest: &str) -> Result<(String, String, Option<String>, bool), String> {
    let (bounds, rest) = take_delimited(rest, '[', ']')?;
    let (lower, upper) = bounds
        .split_once(',')
        .ok_or_else(|| format!("expected [lower, upper], found [{bounds}]"))?;

    let rest = rest.trim();
    let (default, rest) = if rest.starts_with('[') {
        let (default, rest) = take_delimited(rest, '[', ']')?;
        (Some(default.trim().to_string()), rest.trim())
    } else {
        (None, rest)
    };

    let log = match rest {
        "" => false,
        "log" => true,
        other => return Err(format!("unexpected trailing text {other:?}")),
    };
    Ok((lower.to_string(), upper.to_string(), default, log))
}

fn parse_choices(rest: &str) -> Result<(Vec<ParameterValue>, Option<ParameterValue>), String> {
    let (inner, rest) = take_delimited(rest, '{', '}')?;
    let choices = split_list(inner);
    let rest = rest.trim();
    let default = if rest.is_empty() {
        None
    } else {
        let (default, trailing) = take_delimited(rest, '[', ']')?;
        if !trailing.trim().is_empty() {
            return Err(format!("unexpected trailing text {:?}", trailing.trim()));
        }
        Some(parse_token(default))
    };
    Ok((choices, default))
}

fn parse_hyperparameter(line: &str) -> Result<Hyperparameter, String> {
    let mut parts = line.splitn(3, char::is_whitespace);
    let name = parts.next().unwrap_or_default().to_string();
    let kind = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default();

    let kind = match kind {
        "real" => {
            let (lower, upper, default, log) = parse_range(rest)?;
            HyperparameterKind::Float {
                lower: parse_f64(&lower)?,
                upper: parse_f64(&upper)?,
                log,
                default: default.as_deref().map(parse_f64).transpose()?,
            }
        }
        "integer" => {
            let (lower, upper, default, log) = parse_range(rest)?;
            HyperparameterKind::Int {
                lower: parse_i64(&lower)?,
                upper: parse_i64(&upper)?,
                log,
                default: default.as_deref().map(parse_i64).transpose()?,
            }
        }
        "categorical" => {
            let (choices, default) = parse_choices(rest)?;
            HyperparameterKind::Categorical { choices, default }
        }
        "ordinal" => {
            let (sequence, default) = parse_choices(rest)?;
            HyperparameterKind::Ordinal { sequence, default }
        }
        "" => return Err(format!("missing type for hyperparameter {name:?}")),
        other => return Err(format!("unknown hyperparameter type {other:?}")),
    };

    Ok(Hyperparameter { name, kind })
}

fn parse_condition(child: &str, rest: &str) -> Result<Condition, String> {
    if child.is_empty() {
        return Err("condition without a child".to_string());
    }
    if rest.contains("||") || rest.contains("&&") {
        return Err("compound conditions are not supported".to_string());
    }

    if let Some((parent, value)) = rest.split_once("==") {
        return Ok(Condition {
            child: child.to_string(),
            parent: parent.trim().to_string(),
            kind: ConditionKind::Equals,
            values: vec![parse_token(value)],
        });
    }

    let mut parts = rest.splitn(3, char::is_whitespace);
    let parent = parts.next().unwrap_or_default();
    let op = parts.next().unwrap_or_default();
    let values = parts.next().unwrap_or_default();
    if op != "in" {
        return Err(format!("expected 'in' or '==' in condition, found {op:?}"));
    }
    let (inner, trailing) = take_delimited(values, '{', '}')?;
    if !trailing.trim().is_empty() {
        return Err(format!("unexpected trailing text {:?}", trailing.trim()));
    }

    Ok(Condition {
        child: child.to_string(),
        parent: parent.to_string(),
        kind: ConditionKind::In,
        values: split_list(inner),
    })
}
