//! Adaptive per-agent weighting for ensembles of prediction producers, with
//! an injectable weight-calculator node for directed computation graphs.

pub mod ai;
pub mod core;
pub mod graph;

pub use crate::ai::{
    InvocationRecord, LayerManager, SharedWeightManager, WeightCalculator, WeightManager,
};
pub use crate::core::{AdaptiveError, AdaptiveResult, Config};
pub use crate::graph::{Graph, GraphIntegrator};
