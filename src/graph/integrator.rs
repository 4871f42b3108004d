use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use super::{Edge, EdgeKind, Graph, Node, NodeKind};
use crate::ai::consensus::WeightCalculator;
use crate::ai::layer_manager::LayerManager;
use crate::ai::weight_manager::SharedWeightManager;
use crate::core::error::{AdaptiveError, AdaptiveResult};

pub const WEIGHT_NODE_PREFIX: &str = "weight_calc_";

const NODE_TYPE: &str = "weight_calculator";
const DECISION_KEYWORDS: [&str; 5] = ["decision", "consensus", "final", "execute", "trade"];
const WEIGHT_PATH_MARKER: &str = "[WEIGHT]";

/// What happens when a target already has a weight calculator attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReinjectionPolicy {
    #[default]
    Reject,
    Replace,
}

impl fmt::Display for ReinjectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReinjectionPolicy::Reject => write!(f, "reject"),
            ReinjectionPolicy::Replace => write!(f, "replace"),
        }
    }
}

impl FromStr for ReinjectionPolicy {
    type Err = AdaptiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(ReinjectionPolicy::Reject),
            "replace" => Ok(ReinjectionPolicy::Replace),
            other => Err(AdaptiveError::InvalidArgument(format!(
                "unknown reinjection policy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    pub reinjection_policy: ReinjectionPolicy,
    /// Nodes to attach to; decision nodes are auto-detected when empty.
    pub target_nodes: Vec<String>,
}

pub fn create_weight_calculator(
    weight_manager: SharedWeightManager,
    layer_manager: Arc<LayerManager>,
) -> Arc<WeightCalculator> {
    Arc::new(WeightCalculator::new(weight_manager, layer_manager))
}

/// Attaches weight-calculator nodes to an externally owned graph.
pub struct GraphIntegrator {
    calculator: Arc<WeightCalculator>,
    policy: ReinjectionPolicy,
    injected: BTreeMap<String, String>,
}

impl GraphIntegrator {
    pub fn new(
        weight_manager: SharedWeightManager,
        layer_manager: Arc<LayerManager>,
        policy: ReinjectionPolicy,
    ) -> Self {
        Self {
            calculator: create_weight_calculator(weight_manager, layer_manager),
            policy,
            injected: BTreeMap::new(),
        }
    }

    pub fn calculator(&self) -> &Arc<WeightCalculator> {
        &self.calculator
    }

    pub fn policy(&self) -> ReinjectionPolicy {
        self.policy
    }

    /// Injected node name -> target node, for injections made by this integrator.
    pub fn injected_nodes(&self) -> &BTreeMap<String, String> {
        &self.injected
    }

    /// Injects a calculator in front of `target`. Returns the new node's name.
    pub fn integrate_with_graph(
        &mut self,
        graph: Option<&mut Graph>,
        target: &str,
    ) -> AdaptiveResult<String> {
        let mut injected = self.integrate_all(graph, Some(&[target.to_string()]))?;
        Ok(injected.remove(0))
    }

    /// Injects a calculator in front of every target, or every detected
    /// decision node when `targets` is `None`. Either every injection lands
    /// or the graph is left exactly as it was.
    pub fn integrate_all(
        &mut self,
        graph: Option<&mut Graph>,
        targets: Option<&[String]>,
    ) -> AdaptiveResult<Vec<String>> {
        let graph = graph.ok_or_else(|| {
            AdaptiveError::InvalidArgument("no graph supplied for integration".to_string())
        })?;
        let targets = match targets {
            Some(targets) => targets.to_vec(),
            None => Self::find_decision_nodes(graph),
        };

        let mut staged = graph.clone();
        let mut injected = Vec::with_capacity(targets.len());
        for target in &targets {
            injected.push(self.inject(&mut staged, target)?);
        }
        *graph = staged;

        for (node, target) in injected.iter().zip(&targets) {
            self.injected.insert(node.clone(), target.clone());
            tracing::info!("✅ Weight calculator {} attached to {}", node, target);
        }
        Ok(injected)
    }

    fn inject(&self, graph: &mut Graph, target: &str) -> AdaptiveResult<String> {
        let target_node = graph.node(target).ok_or_else(|| {
            AdaptiveError::InvalidArgument(format!("target node {target} not found in graph"))
        })?;
        if target_node.kind == NodeKind::WeightCalculator {
            return Err(AdaptiveError::InvalidArgument(format!(
                "{target} is itself a weight calculator"
            )));
        }

        let node_name = format!("{WEIGHT_NODE_PREFIX}{target}");
        let existing = Self::injected_for(graph, target);
        match (&existing, self.policy) {
            (Some(node), ReinjectionPolicy::Reject) => {
                tracing::warn!("⚠️  {} already has weight calculator {}", target, node);
                return Err(AdaptiveError::DuplicateInjection {
                    target: target.to_string(),
                    node: node.clone(),
                });
            }
            (None, _) if graph.contains_node(&node_name) => {
                return Err(AdaptiveError::NodeExists(node_name));
            }
            _ => {}
        }

        let mut retained = Vec::new();
        if let Some(old) = &existing {
            retained = Self::caller_edges(graph, old, target);
            graph.remove_node(old)?;
            tracing::info!("🔄 Replacing weight calculator {} on {}", old, target);
        }

        let predecessors: Vec<String> = graph
            .predecessors(target)
            .into_iter()
            .map(str::to_string)
            .collect();
        let node = Node::new(&node_name, NodeKind::WeightCalculator)
            .with_metadata("type", json!(NODE_TYPE))
            .with_metadata("target", json!(target))
            .with_metadata("injection_id", json!(Uuid::new_v4().to_string()))
            .with_metadata("injected_at", json!(Utc::now().to_rfc3339()))
            .with_metadata("predecessors", json!(predecessors))
            .with_metadata(
                "description",
                json!(format!("computes agent weights for {target}")),
            )
            .with_handler(self.calculator.clone());

        graph.add_node(node)?;
        for predecessor in &predecessors {
            graph.add_edge(predecessor, &node_name, EdgeKind::Data)?;
        }
        graph.add_edge(&node_name, target, EdgeKind::WeightedDecision)?;
        let rename = |name: String| {
            if existing.as_deref() == Some(name.as_str()) {
                node_name.clone()
            } else {
                name
            }
        };
        for edge in retained {
            graph.add_edge(&rename(edge.from), &rename(edge.to), edge.kind)?;
        }
        Ok(node_name)
    }

    /// Edges touching `calculator` that injection did not create, such as
    /// feedback edges added afterwards.
    fn caller_edges(graph: &Graph, calculator: &str, target: &str) -> Vec<Edge> {
        let wired_from: Vec<String> = graph
            .node(calculator)
            .and_then(|node| node.metadata.get("predecessors"))
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        graph
            .edges()
            .iter()
            .filter(|edge| edge.from == calculator || edge.to == calculator)
            .filter(|edge| {
                let injected_input = edge.to == calculator
                    && edge.kind == EdgeKind::Data
                    && wired_from.contains(&edge.from);
                let injected_output = edge.from == calculator
                    && edge.to == target
                    && edge.kind == EdgeKind::WeightedDecision;
                !injected_input && !injected_output
            })
            .cloned()
            .collect()
    }

    /// The calculator node already attached to `target`, if any.
    fn injected_for(graph: &Graph, target: &str) -> Option<String> {
        graph
            .nodes()
            .find(|node| {
                node.kind == NodeKind::WeightCalculator
                    && node.metadata_str("type") == Some(NODE_TYPE)
                    && node.metadata_str("target") == Some(target)
            })
            .map(|node| node.name.clone())
    }

    /// Nodes whose kind is Decision/Action, or whose name mentions a
    /// decision keyword.
    pub fn find_decision_nodes(graph: &Graph) -> Vec<String> {
        graph
            .nodes()
            .filter(|node| node.kind != NodeKind::WeightCalculator)
            .filter(|node| {
                let name = node.name.to_lowercase();
                matches!(node.kind, NodeKind::Decision | NodeKind::Action)
                    || DECISION_KEYWORDS.iter().any(|keyword| name.contains(keyword))
            })
            .map(|node| node.name.clone())
            .collect()
    }

    /// Adds an outcome feedback edge, e.g. from execution back to a calculator.
    pub fn add_feedback_edge(graph: &mut Graph, from: &str, to: &str) -> AdaptiveResult<()> {
        graph.add_edge(from, to, EdgeKind::Feedback)
    }

    /// Shortest path with weight-calculator nodes marked.
    pub fn weighted_path(graph: &Graph, from: &str, to: &str) -> Vec<String> {
        graph
            .shortest_path(from, to)
            .unwrap_or_default()
            .into_iter()
            .map(|name| match graph.node(&name) {
                Some(node) if node.kind == NodeKind::WeightCalculator => {
                    format!("{WEIGHT_PATH_MARKER}{name}")
                }
                _ => name,
            })
            .collect()
    }
}
