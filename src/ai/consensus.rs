//! Layered, weight-driven consensus over concurrent agent predictions.

use async_trait::async_trait;
use std::sync::Arc;

use super::layer_manager::{CrossLayerRule, LayerManager, ResolvedLayer};
use super::record::{
    validate_actual, validate_predictions, CalculatorResult, InvocationRecord, LayerDecision,
    Predictions, WeightVector,
};
use super::weight_manager::SharedWeightManager;
use crate::core::error::AdaptiveResult;
use crate::graph::NodeHandler;

/// Graph-invokable unit combining a weight manager and a layer manager.
#[derive(Debug, Clone)]
pub struct WeightCalculator {
    weight_manager: SharedWeightManager,
    layer_manager: Arc<LayerManager>,
}

impl WeightCalculator {
    pub fn new(weight_manager: SharedWeightManager, layer_manager: Arc<LayerManager>) -> Self {
        Self {
            weight_manager,
            layer_manager,
        }
    }

    pub fn weight_manager(&self) -> &SharedWeightManager {
        &self.weight_manager
    }

    pub fn layer_manager(&self) -> &Arc<LayerManager> {
        &self.layer_manager
    }

    /// Computes the weighted decision for `record` and returns it augmented
    /// with the result fields. Records without predictions pass through
    /// unchanged apart from the fixed "skipped" augmentation.
    ///
    /// When `actual_value` is present the weights are updated after the
    /// decision is computed, so the outcome only affects later calls.
    pub async fn calculate(&self, mut record: InvocationRecord) -> AdaptiveResult<InvocationRecord> {
        let predictions = match record.predictions.as_ref() {
            Some(predictions) if !predictions.is_empty() => predictions,
            _ => {
                tracing::debug!("No predictions in record, passing through");
                record.result = Some(CalculatorResult::skipped());
                return Ok(record);
            }
        };
        validate_predictions(predictions)?;
        if let Some(actual) = record.actual_value {
            validate_actual(actual)?;
        }

        let (raw_weights, projected) = {
            let manager = self.weight_manager.read().await;
            (
                manager.current_weights(),
                manager.provisional_weights(predictions.keys().map(String::as_str)),
            )
        };

        let layers = self.layer_manager.resolve(predictions);
        let mut result = combine(&layers, &projected, self.layer_manager.cross_layer_rule());
        result.raw_weights = raw_weights;

        if let Some(actual) = record.actual_value {
            let mut manager = self.weight_manager.write().await;
            manager.update(predictions, Some(actual))?;
        }

        tracing::debug!(
            "🎯 Weighted decision {:?} from {} agents across {} layers",
            result.weighted_decision,
            predictions.len(),
            result.layer_decisions.len()
        );

        record.result = Some(result);
        Ok(record)
    }
}

#[async_trait]
impl NodeHandler for WeightCalculator {
    async fn invoke(&self, record: InvocationRecord) -> AdaptiveResult<InvocationRecord> {
        self.calculate(record).await
    }
}

/// Per-layer aggregation followed by the cross-layer combination.
///
/// Each agent's effective weight is its weight re-normalized within its
/// layer, times the layer's share of the final decision.
fn combine(layers: &[ResolvedLayer], weights: &WeightVector, rule: CrossLayerRule) -> CalculatorResult {
    let mut result = CalculatorResult::default();
    if layers.is_empty() {
        return result;
    }

    struct Scored<'a> {
        layer: &'a ResolvedLayer,
        decision: f64,
        mass: f64,
        normalized: Predictions,
    }

    let mut scored = Vec::with_capacity(layers.len());
    for layer in layers {
        let entries: Vec<(f64, f64)> = layer
            .predictions
            .iter()
            .map(|(agent, &prediction)| (prediction, weights.get(agent).copied().unwrap_or(0.0)))
            .collect();
        let Some(decision) = layer.aggregation.aggregate(&entries) else {
            continue;
        };

        let mass: f64 = entries.iter().map(|(_, w)| w).sum();
        let count = layer.predictions.len() as f64;
        let normalized = layer
            .predictions
            .keys()
            .map(|agent| {
                let weight = weights.get(agent).copied().unwrap_or(0.0);
                let share = if mass > 0.0 { weight / mass } else { 1.0 / count };
                (agent.clone(), share)
            })
            .collect();

        scored.push(Scored {
            layer,
            decision,
            mass,
            normalized,
        });
    }

    let total_mass: f64 = scored.iter().map(|s| s.mass).sum();
    let layer_count = scored.len() as f64;
    let mut decision = 0.0;

    for entry in &scored {
        let share = match rule {
            CrossLayerRule::MassWeighted if total_mass > 0.0 => entry.mass / total_mass,
            _ => 1.0 / layer_count,
        };
        decision += share * entry.decision;

        for (agent, within) in &entry.normalized {
            let effective = within * share;
            result.agent_weights.insert(agent.clone(), effective);
            result
                .weighted_predictions
                .insert(agent.clone(), entry.layer.predictions[agent] * effective);
        }

        result.layer_decisions.push(LayerDecision {
            layer: entry.layer.name.clone(),
            decision: entry.decision,
            share,
            agents: entry.layer.predictions.keys().cloned().collect(),
        });
    }

    result.weighted_decision = Some(decision);
    result.has_weights = true;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::layer_manager::Aggregation;
    use crate::ai::weight_manager::{WeightConfig, WeightManager};
    use serde_json::json;

    const TOLERANCE: f64 = 1e-9;

    fn calculator(agents: &[&str], layers: LayerManager) -> WeightCalculator {
        let manager = WeightManager::new(WeightConfig {
            initial_agents: agents.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        });
        WeightCalculator::new(manager.shared(), Arc::new(layers))
    }

    #[tokio::test]
    async fn test_pass_through_without_predictions() {
        let calc = calculator(&["a1", "a2"], LayerManager::new());
        let input = InvocationRecord::new()
            .with_market_data(json!({"symbol": "EURUSD"}))
            .with_actual_value(1.1)
            .with_field("trade_date", json!("2024-01-05"));

        let output = calc.calculate(input.clone()).await.unwrap();
        let result = output.result.clone().unwrap();
        assert!(!result.has_weights);
        assert!(result.weighted_decision.is_none());
        assert!(result.agent_weights.is_empty());
        assert!(result.weighted_predictions.is_empty());
        assert!(result.message.is_some());
        assert_eq!(InvocationRecord { result: None, ..output }, input);

        let empty = InvocationRecord::new().with_predictions(Vec::<(String, f64)>::new());
        let output = calc.calculate(empty).await.unwrap();
        assert!(!output.result.unwrap().has_weights);
    }

    #[tokio::test]
    async fn test_single_layer_decision() {
        let calc = calculator(&["a1", "a2"], LayerManager::new());
        let record = InvocationRecord::new().with_predictions([("a1", 10.0), ("a2", 12.0)]);

        let result = calc.calculate(record).await.unwrap().result.unwrap();
        assert!(result.has_weights);
        assert!((result.weighted_decision.unwrap() - 11.0).abs() < TOLERANCE);
        assert!((result.agent_weights["a1"] - 0.5).abs() < TOLERANCE);
        assert!((result.weighted_predictions["a2"] - 6.0).abs() < TOLERANCE);
        assert_eq!(result.layer_decisions.len(), 1);
        assert_eq!(result.raw_weights.len(), 2);
    }

    #[tokio::test]
    async fn test_no_outcome_calls_never_change_weights() {
        let calc = calculator(&["a1", "a2"], LayerManager::new());
        let before = calc.weight_manager().read().await.current_weights();

        for _ in 0..5 {
            let record = InvocationRecord::new().with_predictions([("a1", 10.0), ("a3", 99.0)]);
            let result = calc.calculate(record).await.unwrap().result.unwrap();
            // a1 and a3 both project to 1/3; within the predicting pair that is 1/3 / (2/3)
            assert!((result.agent_weights["a3"] - 0.5).abs() < TOLERANCE);
            assert!((result.weighted_decision.unwrap() - 54.5).abs() < TOLERANCE);
        }

        let manager = calc.weight_manager().read().await;
        assert_eq!(manager.current_weights(), before);
        assert!(!manager.contains("a3"));
    }

    #[tokio::test]
    async fn test_outcome_updates_after_decision() {
        let calc = calculator(&["a1", "a2"], LayerManager::new());
        let record = InvocationRecord::new()
            .with_predictions([("a1", 10.0), ("a2", 14.0)])
            .with_actual_value(10.0);

        let result = calc.calculate(record).await.unwrap().result.unwrap();
        assert!((result.weighted_decision.unwrap() - 12.0).abs() < TOLERANCE);

        let weights = calc.weight_manager().read().await.current_weights();
        assert!(weights["a1"] > weights["a2"]);
    }

    #[tokio::test]
    async fn test_multi_layer_mean() {
        let mut layers = LayerManager::new();
        layers.register_layer("strategic", ["macro", "quant"], None).unwrap();
        layers
            .register_layer("tactical", ["technical"], Some(Aggregation::SimpleAverage))
            .unwrap();
        let calc = calculator(&["macro", "quant", "technical", "news"], layers);

        let record = InvocationRecord::new().with_predictions([
            ("macro", 1.0),
            ("quant", 3.0),
            ("technical", 5.0),
            ("news", 9.0),
        ]);
        let result = calc.calculate(record).await.unwrap().result.unwrap();

        // strategic 2.0, tactical 5.0, default 9.0
        assert!((result.weighted_decision.unwrap() - 16.0 / 3.0).abs() < TOLERANCE);
        let sum: f64 = result.weighted_predictions.values().sum();
        assert!((sum - result.weighted_decision.unwrap()).abs() < TOLERANCE);
        let weight_sum: f64 = result.agent_weights.values().sum();
        assert!((weight_sum - 1.0).abs() < TOLERANCE);
        assert_eq!(result.layer_decisions[2].layer, "default");
    }

    #[tokio::test]
    async fn test_multi_layer_mass_weighted() {
        let mut layers = LayerManager::new().with_cross_layer_rule(CrossLayerRule::MassWeighted);
        layers.register_layer("big", ["a", "b", "c"], None).unwrap();
        let calc = calculator(&["a", "b", "c", "d"], layers);

        let record = InvocationRecord::new().with_predictions([
            ("a", 4.0),
            ("b", 4.0),
            ("c", 4.0),
            ("d", 8.0),
        ]);
        let result = calc.calculate(record).await.unwrap().result.unwrap();
        assert!((result.weighted_decision.unwrap() - 5.0).abs() < TOLERANCE);
        assert!((result.layer_decisions[0].share - 0.75).abs() < TOLERANCE);
    }

    #[tokio::test]
    async fn test_malformed_predictions_rejected_without_update() {
        let calc = calculator(&["a1", "a2"], LayerManager::new());
        let record = InvocationRecord::new()
            .with_predictions([("a1", f64::NAN), ("a2", 1.0)])
            .with_actual_value(1.0);

        assert!(calc.calculate(record).await.is_err());
        let manager = calc.weight_manager().read().await;
        assert_eq!(manager.history_len(), 0);
    }
}
