use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use super::record::{AgentId, Predictions};
use crate::core::error::{AdaptiveError, AdaptiveResult};

/// Name of the implicit layer holding every agent not assigned elsewhere.
pub const DEFAULT_LAYER: &str = "default";

/// Intra-layer aggregation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    WeightedAverage,
    SimpleAverage,
    Median,
}

impl Aggregation {
    /// Aggregates `(prediction, weight)` pairs. Weighted averaging falls
    /// back to a plain mean when the weights carry no mass.
    pub fn aggregate(&self, entries: &[(f64, f64)]) -> Option<f64> {
        if entries.is_empty() {
            return None;
        }

        let mean = || entries.iter().map(|(p, _)| p).sum::<f64>() / entries.len() as f64;
        match self {
            Aggregation::WeightedAverage => {
                let mass: f64 = entries.iter().map(|(_, w)| w).sum();
                if mass > 0.0 && mass.is_finite() {
                    Some(entries.iter().map(|(p, w)| p * w).sum::<f64>() / mass)
                } else {
                    Some(mean())
                }
            }
            Aggregation::SimpleAverage => Some(mean()),
            Aggregation::Median => {
                let mut values: Vec<f64> = entries.iter().map(|(p, _)| *p).collect();
                values.sort_by(|a, b| a.total_cmp(b));
                let mid = values.len() / 2;
                if values.len() % 2 == 0 {
                    Some((values[mid - 1] + values[mid]) / 2.0)
                } else {
                    Some(values[mid])
                }
            }
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::WeightedAverage => write!(f, "weighted_average"),
            Aggregation::SimpleAverage => write!(f, "simple_average"),
            Aggregation::Median => write!(f, "median"),
        }
    }
}

impl FromStr for Aggregation {
    type Err = AdaptiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "weighted_average" | "weighted" => Ok(Aggregation::WeightedAverage),
            "simple_average" | "mean" => Ok(Aggregation::SimpleAverage),
            "median" => Ok(Aggregation::Median),
            other => Err(AdaptiveError::InvalidArgument(format!(
                "unknown aggregation rule: {other}"
            ))),
        }
    }
}

/// How per-layer decisions combine into the final decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossLayerRule {
    /// Unweighted mean of layer decisions.
    #[default]
    Mean,
    /// Layer decisions weighted by the global weight mass of their agents.
    MassWeighted,
}

impl FromStr for CrossLayerRule {
    type Err = AdaptiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mean" => Ok(CrossLayerRule::Mean),
            "mass_weighted" | "weighted" => Ok(CrossLayerRule::MassWeighted),
            other => Err(AdaptiveError::InvalidArgument(format!(
                "unknown cross-layer rule: {other}"
            ))),
        }
    }
}

/// Declarative layer definition, as read from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    pub agents: Vec<AgentId>,
    #[serde(default)]
    pub aggregation: Aggregation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub name: String,
    pub agents: Vec<AgentId>,
    pub aggregation: Aggregation,
}

/// A layer participating in one call, with its share of the predictions.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLayer {
    pub name: String,
    pub aggregation: Aggregation,
    pub predictions: Predictions,
    pub is_default: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LayerManager {
    layers: Vec<Layer>,
    membership: HashMap<AgentId, usize>,
    cross_layer_rule: CrossLayerRule,
}

impl LayerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cross_layer_rule(mut self, rule: CrossLayerRule) -> Self {
        self.cross_layer_rule = rule;
        self
    }

    pub fn from_specs(specs: &[LayerSpec], rule: CrossLayerRule) -> AdaptiveResult<Self> {
        let mut manager = Self::new().with_cross_layer_rule(rule);
        for spec in specs {
            manager.register_layer(&spec.name, spec.agents.iter().cloned(), Some(spec.aggregation))?;
        }
        Ok(manager)
    }

    pub fn cross_layer_rule(&self) -> CrossLayerRule {
        self.cross_layer_rule
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|layer| layer.name == name)
    }

    pub fn layer_of(&self, agent: &str) -> Option<&str> {
        self.membership
            .get(agent)
            .map(|&index| self.layers[index].name.as_str())
    }

    pub fn register_layer<I, A>(
        &mut self,
        name: &str,
        agents: I,
        aggregation: Option<Aggregation>,
    ) -> AdaptiveResult<()>
    where
        I: IntoIterator<Item = A>,
        A: Into<AgentId>,
    {
        if name == DEFAULT_LAYER || self.layer(name).is_some() {
            return Err(AdaptiveError::DuplicateLayer(name.to_string()));
        }
        let layer = self.build_layer(name, agents, aggregation)?;

        tracing::info!(
            "🧱 Layer {} registered: {} agents, {}",
            layer.name,
            layer.agents.len(),
            layer.aggregation
        );
        self.layers.push(layer);
        self.rebuild_membership();
        Ok(())
    }

    /// Replaces an existing layer's membership and rule in place, keeping
    /// its position in the resolution order.
    pub fn reregister_layer<I, A>(
        &mut self,
        name: &str,
        agents: I,
        aggregation: Option<Aggregation>,
    ) -> AdaptiveResult<()>
    where
        I: IntoIterator<Item = A>,
        A: Into<AgentId>,
    {
        let index = self
            .layers
            .iter()
            .position(|layer| layer.name == name)
            .ok_or_else(|| AdaptiveError::InvalidArgument(format!("unknown layer: {name}")))?;
        let layer = self.build_layer(name, agents, aggregation)?;

        tracing::info!("🧱 Layer {} re-registered: {} agents", name, layer.agents.len());
        self.layers[index] = layer;
        self.rebuild_membership();
        Ok(())
    }

    fn build_layer<I, A>(
        &self,
        name: &str,
        agents: I,
        aggregation: Option<Aggregation>,
    ) -> AdaptiveResult<Layer>
    where
        I: IntoIterator<Item = A>,
        A: Into<AgentId>,
    {
        let mut seen = HashSet::new();
        let agents: Vec<AgentId> = agents
            .into_iter()
            .map(Into::into)
            .filter(|agent: &AgentId| seen.insert(agent.clone()))
            .collect();
        if agents.is_empty() {
            return Err(AdaptiveError::EmptyLayer(name.to_string()));
        }

        for agent in &agents {
            if let Some(&index) = self.membership.get(agent) {
                let owner = &self.layers[index].name;
                if owner != name {
                    return Err(AdaptiveError::AgentConflict {
                        agent: agent.clone(),
                        layer: owner.clone(),
                    });
                }
            }
        }

        Ok(Layer {
            name: name.to_string(),
            agents,
            aggregation: aggregation.unwrap_or_default(),
        })
    }

    fn rebuild_membership(&mut self) {
        self.membership = self
            .layers
            .iter()
            .enumerate()
            .flat_map(|(index, layer)| layer.agents.iter().map(move |agent| (agent.clone(), index)))
            .collect();
    }

    /// Partitions `predictions` into the declared layers that have at least
    /// one participating agent (declaration order), followed by the implicit
    /// default layer for unassigned agents.
    pub fn resolve(&self, predictions: &Predictions) -> Vec<ResolvedLayer> {
        let mut resolved: Vec<ResolvedLayer> = self
            .layers
            .iter()
            .map(|layer| ResolvedLayer {
                name: layer.name.clone(),
                aggregation: layer.aggregation,
                predictions: Predictions::new(),
                is_default: false,
            })
            .collect();
        let mut default_layer = ResolvedLayer {
            name: DEFAULT_LAYER.to_string(),
            aggregation: Aggregation::WeightedAverage,
            predictions: Predictions::new(),
            is_default: true,
        };

        for (agent, &prediction) in predictions {
            match self.membership.get(agent) {
                Some(&index) => resolved[index].predictions.insert(agent.clone(), prediction),
                None => default_layer.predictions.insert(agent.clone(), prediction),
            };
        }

        resolved.push(default_layer);
        resolved.retain(|layer| !layer.predictions.is_empty());
        resolved
    }
}
