//! Search space definitions, conditional activation, and sampling.

use hb_types::{Configuration, ParameterValue, SpaceError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// A single hyperparameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameter {
    /// Name the objective receives the value under (e.g. "learning_rate").
    pub name: String,
    /// The domain the value is drawn from.
    pub kind: HyperparameterKind,
}

/// Describes how a hyperparameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HyperparameterKind {
    /// Continuous range [lower, upper], uniform or log-uniform.
    Float {
        lower: f64,
        upper: f64,
        log: bool,
        default: Option<f64>,
    },
    /// Integer range [lower, upper] inclusive, uniform or log-uniform.
    Int {
        lower: i64,
        upper: i64,
        log: bool,
        default: Option<i64>,
    },
    /// Unordered choices.
    Categorical {
        choices: Vec<ParameterValue>,
        default: Option<ParameterValue>,
    },
    /// Ordered choices.
    Ordinal {
        sequence: Vec<ParameterValue>,
        default: Option<ParameterValue>,
    },
}

impl HyperparameterKind {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterValue {
        match self {
            Self::Float {
                lower, upper, log, ..
            } => {
                if *log {
                    let value: f64 = rng.random_range(lower.ln()..=upper.ln());
                    ParameterValue::Float(value.exp().clamp(*lower, *upper))
                } else {
                    ParameterValue::Float(rng.random_range(*lower..=*upper))
                }
            }
            Self::Int {
                lower, upper, log, ..
            } => {
                if *log {
                    let low = (*lower as f64 - 0.5).ln();
                    let high = (*upper as f64 + 0.5).ln();
                    let value: f64 = rng.random_range(low..=high);
                    ParameterValue::Int((value.exp().round() as i64).clamp(*lower, *upper))
                } else {
                    ParameterValue::Int(rng.random_range(*lower..=*upper))
                }
            }
            Self::Categorical { choices: values, .. } | Self::Ordinal { sequence: values, .. } => {
                let idx = rng.random_range(0..values.len());
                values[idx].clone()
            }
        }
    }

    /// Explicit default, or the domain's midpoint / first choice.
    pub fn default_value(&self) -> ParameterValue {
        match self {
            Self::Float {
                lower,
                upper,
                log,
                default,
            } => ParameterValue::Float(default.unwrap_or_else(|| {
                if *log {
                    ((lower.ln() + upper.ln()) / 2.0).exp()
                } else {
                    (lower + upper) / 2.0
                }
            })),
            Self::Int {
                lower,
                upper,
                log,
                default,
            } => ParameterValue::Int(default.unwrap_or_else(|| {
                let mid = if *log {
                    ((*lower as f64).ln() / 2.0 + (*upper as f64).ln() / 2.0).exp()
                } else {
                    (*lower as f64 + *upper as f64) / 2.0
                };
                (mid.round() as i64).clamp(*lower, *upper)
            })),
            Self::Categorical { choices: values, default }
            | Self::Ordinal { sequence: values, default } => default
                .clone()
                .unwrap_or_else(|| values[0].clone()),
        }
    }

    fn contains(&self, value: &ParameterValue) -> bool {
        match (self, value) {
            (Self::Float { lower, upper, .. }, v) => v
                .as_f64()
                .is_some_and(|x| x >= *lower && x <= *upper),
            (Self::Int { lower, upper, .. }, ParameterValue::Int(x)) => x >= lower && x <= upper,
            (Self::Int { .. }, _) => false,
            (Self::Categorical { choices: values, .. }, v)
            | (Self::Ordinal { sequence: values, .. }, v) => {
                values.iter().any(|choice| same_value(choice, v))
            }
        }
    }

    /// Move `value` a random step of at most `scale` (a fraction of the
    /// domain) while staying inside it. Choices are redrawn with
    /// probability `scale`.
    fn perturb<R: Rng + ?Sized>(&self, value: &ParameterValue, scale: f64, rng: &mut R) -> ParameterValue {
        match self {
            Self::Float {
                lower, upper, log, ..
            } => {
                let Some(x) = value.as_f64() else {
                    return self.sample(rng);
                };
                let jitter: f64 = rng.random_range(-scale..=scale);
                if *log {
                    let span = upper.ln() - lower.ln();
                    ParameterValue::Float((x.ln() + jitter * span).exp().clamp(*lower, *upper))
                } else {
                    ParameterValue::Float((x + jitter * (upper - lower)).clamp(*lower, *upper))
                }
            }
            Self::Int { lower, upper, .. } => {
                let Some(x) = value.as_i64() else {
                    return self.sample(rng);
                };
                let step = ((scale * (upper - lower) as f64).round() as i64).max(1);
                ParameterValue::Int((x + rng.random_range(-step..=step)).clamp(*lower, *upper))
            }
            Self::Categorical { .. } => {
                if rng.random::<f64>() < scale {
                    self.sample(rng)
                } else {
                    value.clone()
                }
            }
            Self::Ordinal { sequence, .. } => {
                let Some(idx) = sequence.iter().position(|v| same_value(v, value)) else {
                    return self.sample(rng);
                };
                let last = sequence.len() as i64 - 1;
                let step = ((scale * sequence.len() as f64).round() as i64).max(1);
                let moved = (idx as i64 + rng.random_range(-step..=step)).clamp(0, last);
                sequence[moved as usize].clone()
            }
        }
    }

    fn grid_len(&self) -> Option<usize> {
        match self {
            Self::Int { lower, upper, .. } => usize::try_from(upper - lower + 1).ok(),
            Self::Categorical { choices: values, .. } | Self::Ordinal { sequence: values, .. } => {
                Some(values.len())
            }
            // Continuous dimensions need explicit step count.
            Self::Float { .. } => None,
        }
    }

    fn grid_values(&self, float_steps: usize) -> Vec<ParameterValue> {
        match self {
            Self::Float {
                lower, upper, log, ..
            } => {
                let steps = float_steps.max(2);
                let (low, high) = if *log {
                    (lower.ln(), upper.ln())
                } else {
                    (*lower, *upper)
                };
                (0..steps)
                    .map(|i| {
                        let t = i as f64 / (steps - 1) as f64;
                        let x = low + t * (high - low);
                        ParameterValue::Float(if *log { x.exp().clamp(*lower, *upper) } else { x })
                    })
                    .collect()
            }
            Self::Int { lower, upper, .. } => (*lower..=*upper).map(ParameterValue::Int).collect(),
            Self::Categorical { choices: values, .. } | Self::Ordinal { sequence: values, .. } => {
                values.clone()
            }
        }
    }
}

/// Loose equality so `1`, `1.0` and `"1"` all match a condition value of `1`.
fn same_value(a: &ParameterValue, b: &ParameterValue) -> bool {
    a == b || a.to_string() == b.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionKind {
    /// `child | parent == value`
    Equals,
    /// `child | parent in {a, b, ...}`
    In,
}

/// Activates `child` only when `parent` takes one of `values`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub child: String,
    pub parent: String,
    pub kind: ConditionKind,
    pub values: Vec<ParameterValue>,
}

impl Condition {
    pub fn equals(
        child: impl Into<String>,
        parent: impl Into<String>,
        value: impl Into<ParameterValue>,
    ) -> Self {
        Self {
            child: child.into(),
            parent: parent.into(),
            kind: ConditionKind::Equals,
            values: vec![value.into()],
        }
    }

    pub fn in_values<V: Into<ParameterValue>>(
        child: impl Into<String>,
        parent: impl Into<String>,
        values: Vec<V>,
    ) -> Self {
        Self {
            child: child.into(),
            parent: parent.into(),
            kind: ConditionKind::In,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_satisfied_by(&self, parent_value: &ParameterValue) -> bool {
        self.values.iter().any(|v| same_value(v, parent_value))
    }
}

/// The full search space: an ordered list of hyperparameters plus conditions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub hyperparameters: Vec<Hyperparameter>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, hyperparameter: Hyperparameter) -> Self {
        self.hyperparameters.push(hyperparameter);
        self
    }

    pub fn add_float(self, name: impl Into<String>, lower: f64, upper: f64) -> Self {
        self.add(Hyperparameter {
            name: name.into(),
            kind: HyperparameterKind::Float {
                lower,
                upper,
                log: false,
                default: None,
            },
        })
    }

    pub fn add_log_float(self, name: impl Into<String>, lower: f64, upper: f64) -> Self {
        self.add(Hyperparameter {
            name: name.into(),
            kind: HyperparameterKind::Float {
                lower,
                upper,
                log: true,
                default: None,
            },
        })
    }

    pub fn add_int(self, name: impl Into<String>, lower: i64, upper: i64) -> Self {
        self.add(Hyperparameter {
            name: name.into(),
            kind: HyperparameterKind::Int {
                lower,
                upper,
                log: false,
                default: None,
            },
        })
    }

    pub fn add_categorical<V: Into<ParameterValue>>(
        self,
        name: impl Into<String>,
        choices: Vec<V>,
    ) -> Self {
        self.add(Hyperparameter {
            name: name.into(),
            kind: HyperparameterKind::Categorical {
                choices: choices.into_iter().map(Into::into).collect(),
                default: None,
            },
        })
    }

    pub fn add_ordinal<V: Into<ParameterValue>>(
        self,
        name: impl Into<String>,
        sequence: Vec<V>,
    ) -> Self {
        self.add(Hyperparameter {
            name: name.into(),
            kind: HyperparameterKind::Ordinal {
                sequence: sequence.into_iter().map(Into::into).collect(),
                default: None,
            },
        })
    }

    pub fn add_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn len(&self) -> usize {
        self.hyperparameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hyperparameters.is_empty()
    }

    pub fn hyperparameter(&self, name: &str) -> Option<&Hyperparameter> {
        self.hyperparameters.iter().find(|h| h.name == name)
    }

    pub fn hyperparameter_names(&self) -> Vec<&str> {
        self.hyperparameters.iter().map(|h| h.name.as_str()).collect()
    }

    /// Check bounds, defaults, name uniqueness, and condition references.
    pub fn validate(&self) -> Result<(), SpaceError> {
        let mut seen = HashSet::new();
        for hp in &self.hyperparameters {
            if hp.name.is_empty() || hp.name.chars().any(|c| c.is_whitespace() || "|{}[],".contains(c)) {
                return Err(invalid(format!("illegal hyperparameter name {:?}", hp.name)));
            }
            if !seen.insert(hp.name.as_str()) {
                return Err(invalid(format!("duplicate hyperparameter {}", hp.name)));
            }
            validate_kind(&hp.name, &hp.kind)?;
        }

        let mut parents: HashMap<&str, Vec<&str>> = HashMap::new();
        for cond in &self.conditions {
            for name in [&cond.child, &cond.parent] {
                if !seen.contains(name.as_str()) {
                    return Err(SpaceError::UnknownHyperparameter { name: name.clone() });
                }
            }
            if cond.child == cond.parent {
                return Err(invalid(format!("{} cannot be conditioned on itself", cond.child)));
            }
            if cond.values.is_empty() {
                return Err(invalid(format!("condition on {} has no values", cond.child)));
            }
            parents
                .entry(cond.child.as_str())
                .or_default()
                .push(cond.parent.as_str());
        }

        for start in parents.keys() {
            let mut stack = vec![*start];
            let mut visited = HashSet::new();
            while let Some(node) = stack.pop() {
                for parent in parents.get(node).into_iter().flatten() {
                    if parent == start {
                        return Err(invalid(format!("conditions on {start} form a cycle")));
                    }
                    if visited.insert(*parent) {
                        stack.push(*parent);
                    }
                }
            }
        }

        Ok(())
    }

    /// Draw one configuration uniformly from the space's native domains.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Configuration {
        let values = self
            .hyperparameters
            .iter()
            .map(|hp| (hp.name.clone(), hp.kind.sample(rng)))
            .collect();
        self.prune_inactive(values)
    }

    /// Sample with the thread-local generator.
    pub fn sample_configuration(&self) -> Configuration {
        self.sample(&mut rand::rng())
    }

    /// A configuration near `base`: every active value is perturbed by up to
    /// `scale` of its domain. Values missing from `base` (children that
    /// become active) are sampled fresh.
    pub fn neighbor<R: Rng + ?Sized>(&self, base: &Configuration, scale: f64, rng: &mut R) -> Configuration {
        let values = self
            .hyperparameters
            .iter()
            .map(|hp| {
                let value = match base.get(&hp.name) {
                    Some(current) if hp.kind.contains(current) => hp.kind.perturb(current, scale, rng),
                    _ => hp.kind.sample(rng),
                };
                (hp.name.clone(), value)
            })
            .collect();
        self.prune_inactive(values)
    }

    pub fn default_configuration(&self) -> Configuration {
        let values = self
            .hyperparameters
            .iter()
            .map(|hp| (hp.name.clone(), hp.kind.default_value()))
            .collect();
        self.prune_inactive(values)
    }

    /// Whether `config` assigns exactly the active hyperparameters, each in its domain.
    pub fn contains(&self, config: &Configuration) -> bool {
        let values: BTreeMap<String, ParameterValue> = config
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let all_known = config.names().all(|name| self.hyperparameter(name).is_some());
        let in_domain = config.iter().all(|(name, value)| {
            self.hyperparameter(name)
                .is_some_and(|hp| hp.kind.contains(value))
        });
        all_known && in_domain && self.prune_inactive(values) == *config
    }

    /// Total number of grid points (returns `None` if any parameter is
    /// continuous without a natural grid).
    pub fn grid_size(&self) -> Option<usize> {
        let mut total: usize = 1;
        for hp in &self.hyperparameters {
            total = total.checked_mul(hp.kind.grid_len()?)?;
        }
        Some(total)
    }

    /// Every grid point, with continuous dimensions discretised into
    /// `float_steps` points. Inactive children are dropped and the
    /// resulting duplicates removed.
    pub fn grid(&self, float_steps: usize) -> Vec<Configuration> {
        let mut axes: Vec<Vec<(&str, ParameterValue)>> = Vec::new();
        for hp in &self.hyperparameters {
            axes.push(
                hp.kind
                    .grid_values(float_steps)
                    .into_iter()
                    .map(|v| (hp.name.as_str(), v))
                    .collect(),
            );
        }

        // Cartesian product
        let mut product: Vec<BTreeMap<String, ParameterValue>> = vec![BTreeMap::new()];
        for axis in &axes {
            let mut next = Vec::with_capacity(product.len() * axis.len());
            for existing in &product {
                for (name, value) in axis {
                    let mut combo = existing.clone();
                    combo.insert(name.to_string(), value.clone());
                    next.push(combo);
                }
            }
            product = next;
        }

        let mut grid: Vec<Configuration> = Vec::with_capacity(product.len());
        for combo in product {
            let config = self.prune_inactive(combo);
            if !grid.contains(&config) {
                grid.push(config);
            }
        }
        grid
    }

    /// Drop every hyperparameter whose conditions do not hold (transitively).
    fn prune_inactive(&self, values: BTreeMap<String, ParameterValue>) -> Configuration {
        let mut active: HashSet<&str> = self
            .hyperparameters
            .iter()
            .map(|h| h.name.as_str())
            .collect();

        loop {
            let mut changed = false;
            for cond in &self.conditions {
                if !active.contains(cond.child.as_str()) {
                    continue;
                }
                let holds = active.contains(cond.parent.as_str())
                    && values
                        .get(&cond.parent)
                        .is_some_and(|v| cond.is_satisfied_by(v));
                if !holds {
                    active.remove(cond.child.as_str());
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        values
            .into_iter()
            .filter(|(name, _)| active.contains(name.as_str()))
            .collect()
    }
}

fn invalid(message: String) -> SpaceError {
    SpaceError::Invalid { message }
}

fn validate_kind(name: &str, kind: &HyperparameterKind) -> Result<(), SpaceError> {
    match kind {
        HyperparameterKind::Float {
            lower,
            upper,
            log,
            default,
        } => {
            if !lower.is_finite() || !upper.is_finite() || lower >= upper {
                return Err(invalid(format!("{name}: bounds [{lower}, {upper}] are not a range")));
            }
            if *log && *lower <= 0.0 {
                return Err(invalid(format!("{name}: log scale needs a positive lower bound")));
            }
        }
        HyperparameterKind::Int {
            lower, upper, log, ..
        } => {
            if lower > upper {
                return Err(invalid(format!("{name}: bounds [{lower}, {upper}] are not a range")));
            }
            if *log && *lower <= 0 {
                return Err(invalid(format!("{name}: log scale needs a positive lower bound")));
            }
        }
        HyperparameterKind::Categorical { choices: values, .. }
        | HyperparameterKind::Ordinal { sequence: values, .. } => {
            if values.is_empty() {
                return Err(invalid(format!("{name}: no choices")));
            }
            let distinct: HashSet<String> = values.iter().map(|v| v.to_string()).collect();
            if distinct.len() != values.len() {
                return Err(invalid(format!("{name}: duplicate choices")));
            }
        }
    }

    let has_explicit_default = match kind {
        HyperparameterKind::Float { default, .. } => default.is_some(),
        HyperparameterKind::Int { default, .. } => default.is_some(),
        HyperparameterKind::Categorical { default, .. }
        | HyperparameterKind::Ordinal { default, .. } => default.is_some(),
    };
    if has_explicit_default && !kind.contains(&kind.default_value()) {
        return Err(invalid(format!("{name}: default {} outside domain", kind.default_value())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample_space() -> SearchSpace {
        SearchSpace::new()
            .add_int("num_layers", 1, 8)
            .add_log_float("learning_rate", 1e-5, 1e-1)
            .add_float("dropout", 0.0, 0.5)
            .add_categorical("optimizer", vec!["adam", "sgd"])
    }

    #[test]
    fn random_sampling_respects_bounds() {
        let space = sample_space();
        space.validate().unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..200 {
            let config = space.sample(&mut rng);
            assert!(space.contains(&config), "sampled {config} outside space");
            match config.get("learning_rate") {
                Some(ParameterValue::Float(v)) => {
                    assert!(*v >= 1e-5 && *v <= 1e-1, "learning_rate out of bounds: {v}")
                }
                other => panic!("unexpected learning_rate value: {other:?}"),
            }
            match config.get("num_layers") {
                Some(ParameterValue::Int(v)) => assert!((1..=8).contains(v)),
                other => panic!("unexpected num_layers value: {other:?}"),
            }
        }
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let space = sample_space();
        let a: Vec<_> = {
            let mut rng = StdRng::seed_from_u64(42);
            (0..5).map(|_| space.sample(&mut rng)).collect()
        };
        let b: Vec<_> = {
            let mut rng = StdRng::seed_from_u64(42);
            (0..5).map(|_| space.sample(&mut rng)).collect()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn log_int_stays_in_bounds() {
        let space = SearchSpace::new().add(Hyperparameter {
            name: "batch".into(),
            kind: HyperparameterKind::Int {
                lower: 16,
                upper: 512,
                log: true,
                default: None,
            },
        });
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            let v = space.sample(&mut rng).get("batch").and_then(|v| v.as_i64()).unwrap();
            assert!((16..=512).contains(&v), "batch out of bounds: {v}");
        }
    }

    #[test]
    fn grid_covers_every_integer() {
        let space = SearchSpace::new().add_int("w", -3, 3);
        assert_eq!(space.grid_size(), Some(7));

        let grid = space.grid(5);
        assert_eq!(grid.len(), 7);
        let values: Vec<i64> = grid
            .iter()
            .map(|c| c.get("w").and_then(|v| v.as_i64()).unwrap())
            .collect();
        assert_eq!(values, vec![-3, -2, -1, 0, 1, 2, 3]);
    }

    #[test]
    fn grid_discretises_floats() {
        let space = SearchSpace::new()
            .add_float("x", 0.0, 1.0)
            .add_categorical("c", vec!["a", "b"]);
        assert_eq!(space.grid_size(), None);
        let grid = space.grid(3);
        assert_eq!(grid.len(), 6);
        assert!(grid
            .iter()
            .any(|c| c.get("x") == Some(&ParameterValue::Float(0.5))));
    }

    #[test]
    fn conditions_drop_inactive_children() {
        let space = SearchSpace::new()
            .add_categorical("optimizer", vec!["adam", "sgd"])
            .add_float("momentum", 0.0, 0.99)
            .add_condition(Condition::equals("momentum", "optimizer", "sgd"));
        space.validate().unwrap();

        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let config = space.sample(&mut rng);
            let is_sgd = config.get("optimizer").and_then(|v| v.as_str()) == Some("sgd");
            assert_eq!(config.contains("momentum"), is_sgd, "bad activation in {config}");
        }

        // adam without momentum, and sgd with each momentum grid point
        let grid = space.grid(3);
        assert_eq!(grid.len(), 4);
    }

    #[test]
    fn chained_conditions_are_transitive() {
        let space = SearchSpace::new()
            .add_categorical("a", vec!["on", "off"])
            .add_categorical("b", vec!["x", "y"])
            .add_float("c", 0.0, 1.0)
            .add_condition(Condition::equals("b", "a", "on"))
            .add_condition(Condition::in_values("c", "b", vec!["x", "y"]));
        space.validate().unwrap();

        let config = Configuration::new().with("a", "off");
        assert!(space.contains(&config));
        let with_orphan = Configuration::new().with("a", "off").with("c", 0.5);
        assert!(!space.contains(&with_orphan));
    }

    #[test]
    fn validate_rejects_bad_spaces() {
        let reversed = SearchSpace::new().add_float("x", 1.0, 0.0);
        assert!(matches!(reversed.validate(), Err(SpaceError::Invalid { .. })));

        let log_zero = SearchSpace::new().add_log_float("lr", 0.0, 1.0);
        assert!(log_zero.validate().is_err());

        let duplicate = SearchSpace::new().add_int("a", 0, 1).add_int("a", 0, 2);
        assert!(duplicate.validate().is_err());

        let unknown_parent = SearchSpace::new()
            .add_int("a", 0, 1)
            .add_condition(Condition::equals("a", "ghost", 1i64));
        assert!(matches!(
            unknown_parent.validate(),
            Err(SpaceError::UnknownHyperparameter { .. })
        ));

        let cycle = SearchSpace::new()
            .add_int("a", 0, 1)
            .add_int("b", 0, 1)
            .add_condition(Condition::equals("a", "b", 1i64))
            .add_condition(Condition::equals("b", "a", 1i64));
        assert!(cycle.validate().is_err());

        let bad_default = SearchSpace::new().add(Hyperparameter {
            name: "x".into(),
            kind: HyperparameterKind::Float {
                lower: 0.0,
                upper: 1.0,
                log: false,
                default: Some(2.0),
            },
        });
        assert!(bad_default.validate().is_err());
    }

    #[test]
    fn neighbors_stay_close_and_inside() {
        let space = sample_space().add_ordinal("size", vec!["s", "m", "l"]);
        let mut rng = StdRng::seed_from_u64(11);
        let base = space.default_configuration();
        let base_dropout = base.get("dropout").and_then(|v| v.as_f64()).unwrap();

        for _ in 0..100 {
            let near = space.neighbor(&base, 0.1, &mut rng);
            assert!(space.contains(&near), "neighbor {near} outside space");
            let dropout = near.get("dropout").and_then(|v| v.as_f64()).unwrap();
            assert!((dropout - base_dropout).abs() <= 0.05 + 1e-12);
        }
    }

    #[test]
    fn neighbor_fills_newly_active_children() {
        let space = SearchSpace::new()
            .add_categorical("optimizer", vec!["adam", "sgd"])
            .add_float("momentum", 0.0, 0.99)
            .add_condition(Condition::equals("momentum", "optimizer", "sgd"));
        let base = Configuration::new().with("optimizer", "adam");
        let mut rng = StdRng::seed_from_u64(5);

        // scale 1.0 redraws the categorical every time
        for _ in 0..50 {
            let near = space.neighbor(&base, 1.0, &mut rng);
            assert!(space.contains(&near), "neighbor {near} outside space");
        }
    }

    #[test]
    fn default_configuration_uses_midpoints() {
        let space = SearchSpace::new()
            .add_float("x", 0.0, 1.0)
            .add_int("n", 1, 9)
            .add_ordinal("size", vec!["small", "large"]);
        let config = space.default_configuration();
        assert_eq!(config.get("x"), Some(&ParameterValue::Float(0.5)));
        assert_eq!(config.get("n"), Some(&ParameterValue::Int(5)));
        assert_eq!(config.get("size").and_then(|v| v.as_str()), Some("small"));
    }

    #[test]
    fn search_space_builder_chain() {
        let space = sample_space().add_ordinal("size", vec!["s", "m", "l"]);
        assert_eq!(space.len(), 5);
        assert_eq!(
            space.hyperparameter_names(),
            vec!["num_layers", "learning_rate", "dropout", "optimizer", "size"]
        );
    }
}
