//! Configuration proposal strategies.

use hb_space::SearchSpace;
use hb_types::{Budget, Configuration};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Produces candidate configurations for the first rung of a bracket.
pub trait ConfigSampler: Send {
    /// Generate `count` configurations for evaluation at `budget`.
    fn suggest(&mut self, budget: Budget, count: usize) -> Vec<Configuration>;

    /// Report a completed run so adaptive strategies can learn.
    fn report(&mut self, _configuration: &Configuration, _budget: Budget, _loss: f64) {}

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    }
}

// ---- Random search ----

/// Independent uniform draws from the space.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    space: SearchSpace,
    rng: StdRng,
}

impl RandomSampler {
    pub fn new(space: SearchSpace) -> Self {
        Self::with_seed(space, None)
    }

    pub fn with_seed(space: SearchSpace, seed: Option<u64>) -> Self {
        Self {
            space,
            rng: rng_from(seed),
        }
    }
}

impl ConfigSampler for RandomSampler {
    fn suggest(&mut self, _budget: Budget, count: usize) -> Vec<Configuration> {
        (0..count).map(|_| self.space.sample(&mut self.rng)).collect()
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Grid search ----

/// Walks the space's grid in order, starting over once it runs out.
#[derive(Debug, Clone)]
pub struct GridSampler {
    combos: Vec<Configuration>,
    cursor: usize,
}

impl GridSampler {
    /// `float_steps` points are taken along each continuous dimension.
    pub fn new(space: &SearchSpace, float_steps: usize) -> Self {
        Self {
            combos: space.grid(float_steps),
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.combos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.combos.is_empty()
    }
}

impl ConfigSampler for GridSampler {
    fn suggest(&mut self, _budget: Budget, count: usize) -> Vec<Configuration> {
        if self.combos.is_empty() {
            return Vec::new();
        }
        (0..count)
            .map(|_| {
                let combo = self.combos[self.cursor].clone();
                self.cursor = (self.cursor + 1) % self.combos.len();
                combo
            })
            .collect()
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Perturbation search ----

/// Explore/exploit sampler.
///
/// With probability `exploration_weight` (and always before anything has
/// been reported) it draws a fresh random configuration. Otherwise it
/// perturbs the best configuration observed at the highest budget seen so
/// far, so promising regions get sampled more densely as results come in.
#[derive(Debug, Clone)]
pub struct PerturbationSampler {
    space: SearchSpace,
    rng: StdRng,
    observations: Vec<(Configuration, Budget, f64)>,
    exploration_weight: f64,
    /// Fraction of each domain a perturbation may move.
    scale: f64,
}

impl PerturbationSampler {
    pub fn new(space: SearchSpace, exploration_weight: f64) -> Self {
        Self::with_seed(space, exploration_weight, None)
    }

    pub fn with_seed(space: SearchSpace, exploration_weight: f64, seed: Option<u64>) -> Self {
        Self {
            space,
            rng: rng_from(seed),
            observations: Vec::new(),
            exploration_weight: exploration_weight.clamp(0.0, 1.0),
            scale: 0.1,
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale.clamp(0.0, 1.0);
        self
    }

    pub fn observations(&self) -> usize {
        self.observations.len()
    }

    /// Lowest-loss configuration among those run at the highest budget.
    fn best(&self) -> Option<&Configuration> {
        let top = self
            .observations
            .iter()
            .map(|(_, budget, _)| *budget)
            .fold(f64::NEG_INFINITY, f64::max);
        self.observations
            .iter()
            .filter(|(_, budget, _)| *budget == top)
            .min_by(|a, b| a.2.total_cmp(&b.2))
            .map(|(configuration, _, _)| configuration)
    }

    fn explore(&mut self) -> Configuration {
        self.space.sample(&mut self.rng)
    }

    fn exploit(&mut self) -> Configuration {
        match self.best().cloned() {
            Some(base) => self.space.neighbor(&base, self.scale, &mut self.rng),
            None => self.explore(),
        }
    }
}

impl ConfigSampler for PerturbationSampler {
    fn suggest(&mut self, _budget: Budget, count: usize) -> Vec<Configuration> {
        (0..count)
            .map(|_| {
                if self.observations.is_empty() || self.rng.random::<f64>() < self.exploration_weight {
                    self.explore()
                } else {
                    self.exploit()
                }
            })
            .collect()
    }

    fn report(&mut self, configuration: &Configuration, budget: Budget, loss: f64) {
        self.observations.push((configuration.clone(), budget, loss));
    }

    fn name(&self) -> &str {
        "perturbation"
    }
}
