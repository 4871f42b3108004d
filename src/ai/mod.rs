pub mod consensus;
pub mod layer_manager;
pub mod record;
pub mod weight_manager;

pub use consensus::WeightCalculator;
pub use layer_manager::{
    Aggregation, CrossLayerRule, Layer, LayerManager, LayerSpec, ResolvedLayer, DEFAULT_LAYER,
};
pub use record::{
    AgentId, CalculatorResult, InvocationRecord, LayerDecision, Predictions, WeightVector,
};
pub use weight_manager::{
    AgentStats, ErrorMetric, SharedWeightManager, WeightConfig, WeightManager, WeightUpdate,
};
