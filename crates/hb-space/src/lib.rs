//! # hb-space
//!
//! The search space collaborator for HalfBand: hyperparameter domains,
//! conditional activation, random sampling, grid enumeration, and the two
//! interchange formats (`.pcs` and `.json`).

pub mod format;
mod space;

pub use format::{parse_space, read_space, write_space, write_space_file, SpaceFormat};
pub use space::{Condition, ConditionKind, Hyperparameter, HyperparameterKind, SearchSpace};
