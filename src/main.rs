use adaptive_agent_weights::ai::{InvocationRecord, LayerManager, LayerSpec};
use adaptive_agent_weights::core::{self, Config};
use adaptive_agent_weights::graph::{EdgeKind, Graph, GraphIntegrator, Node, NodeKind};
use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;

const DEFAULT_CYCLES: usize = 20;

struct SimulatedAgent {
    name: &'static str,
    bias: f64,
    noise: f64,
    phase: f64,
}

const AGENTS: [SimulatedAgent; 4] = [
    SimulatedAgent { name: "macro_analyst", bias: 0.10, noise: 0.05, phase: 0.0 },
    SimulatedAgent { name: "news_analyst", bias: -0.60, noise: 0.40, phase: 1.3 },
    SimulatedAgent { name: "technical_analyst", bias: 0.02, noise: 0.10, phase: 2.1 },
    SimulatedAgent { name: "quantitative_analyst", bias: 0.25, noise: 0.02, phase: 0.7 },
];

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = Config::from_env()?;

    core::logging::init_logging(&config.monitoring.log_level);

    tracing::info!("🚀 Adaptive agent weighting starting...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if config.weights.initial_agents.is_empty() {
        config.weights.initial_agents = AGENTS.iter().map(|a| a.name.to_string()).collect();
    }
    if config.layers.definitions.is_empty() {
        config.layers.definitions = demo_layers();
    }

    let cycles = std::env::args()
        .nth(1)
        .map(|raw| raw.parse::<usize>())
        .transpose()
        .context("cycle count must be a positive integer")?
        .unwrap_or(DEFAULT_CYCLES);

    let weight_manager = config.weight_manager().shared();
    let layer_manager: Arc<LayerManager> = Arc::new(config.layer_manager()?);

    let mut graph = demo_graph()?;
    let mut integrator = GraphIntegrator::new(
        weight_manager.clone(),
        layer_manager,
        config.integration.reinjection_policy,
    );
    let targets = if config.integration.target_nodes.is_empty() {
        None
    } else {
        Some(config.integration.target_nodes.as_slice())
    };
    let injected = integrator.integrate_all(Some(&mut graph), targets)?;
    let Some(calculator_node) = injected.first().cloned() else {
        tracing::warn!("No decision nodes found, nothing to weight");
        return Ok(());
    };
    GraphIntegrator::add_feedback_edge(&mut graph, "execution", &calculator_node)?;
    tracing::info!(
        "Feedback path: {}",
        GraphIntegrator::weighted_path(&graph, "execution", &calculator_node).join(" -> ")
    );

    // Nodes that never carry predictions see no change in behavior.
    let untouched = graph
        .invoke(&calculator_node, InvocationRecord::new().with_market_data(json!({"symbol": "EURUSD"})))
        .await?;
    tracing::info!("Pass-through record: {}", untouched.to_json());

    for cycle in 0..cycles {
        let actual = (cycle as f64 * 0.4).sin() * 0.5;
        let predictions: Vec<(&str, f64)> = AGENTS
            .iter()
            .map(|agent| (agent.name, simulated_prediction(agent, actual, cycle)))
            .collect();

        let record = InvocationRecord::new()
            .with_predictions(predictions)
            .with_market_data(json!({"symbol": "EURUSD", "cycle": cycle}))
            .with_actual_value(actual);
        let output = graph.invoke(&calculator_node, record).await?;

        if let Some(result) = output.result {
            tracing::info!(
                "Cycle {:>3}: decision {:+.4} vs actual {:+.4}",
                cycle,
                result.weighted_decision.unwrap_or_default(),
                actual
            );
        }
    }

    tracing::info!("{}", weight_manager.read().await.format_report());
    Ok(())
}

fn simulated_prediction(agent: &SimulatedAgent, actual: f64, cycle: usize) -> f64 {
    actual + agent.bias + agent.noise * (cycle as f64 * 1.7 + agent.phase).sin()
}

fn demo_layers() -> Vec<LayerSpec> {
    vec![
        LayerSpec {
            name: "strategic".to_string(),
            agents: vec!["macro_analyst".to_string(), "quantitative_analyst".to_string()],
            aggregation: Default::default(),
        },
        LayerSpec {
            name: "tactical".to_string(),
            agents: vec!["technical_analyst".to_string()],
            aggregation: Default::default(),
        },
    ]
}

fn demo_graph() -> Result<Graph> {
    let mut graph = Graph::new();
    for (name, kind) in [
        ("market_data", NodeKind::Data),
        ("technical_processor", NodeKind::Processor),
        ("sentiment_processor", NodeKind::Processor),
        ("risk_processor", NodeKind::Processor),
        ("consensus", NodeKind::Decision),
        ("trade_decision", NodeKind::Decision),
        ("execution", NodeKind::Action),
    ] {
        graph.add_node(Node::new(name, kind))?;
    }
    for (from, to) in [
        ("market_data", "technical_processor"),
        ("market_data", "sentiment_processor"),
        ("market_data", "risk_processor"),
        ("technical_processor", "consensus"),
        ("sentiment_processor", "consensus"),
        ("risk_processor", "consensus"),
        ("consensus", "trade_decision"),
        ("trade_decision", "execution"),
    ] {
        graph.add_edge(from, to, EdgeKind::Data)?;
    }
    Ok(graph)
}
