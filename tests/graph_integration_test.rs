use adaptive_agent_weights::ai::{
    InvocationRecord, LayerManager, SharedWeightManager, WeightConfig, WeightManager,
};
use adaptive_agent_weights::graph::{
    EdgeKind, Graph, GraphIntegrator, Node, NodeKind, ReinjectionPolicy,
};
use adaptive_agent_weights::AdaptiveError;
use serde_json::json;
use std::sync::Arc;

const TOLERANCE: f64 = 1e-9;

fn trading_graph() -> Graph {
    let mut graph = Graph::new();
    for (name, kind) in [
        ("market_data", NodeKind::Data),
        ("technical_processor", NodeKind::Processor),
        ("sentiment_processor", NodeKind::Processor),
        ("consensus", NodeKind::Decision),
        ("trade_decision", NodeKind::Decision),
        ("execution", NodeKind::Action),
    ] {
        graph.add_node(Node::new(name, kind)).unwrap();
    }
    for (from, to) in [
        ("market_data", "technical_processor"),
        ("market_data", "sentiment_processor"),
        ("technical_processor", "consensus"),
        ("sentiment_processor", "consensus"),
        ("consensus", "trade_decision"),
        ("trade_decision", "execution"),
    ] {
        graph.add_edge(from, to, EdgeKind::Data).unwrap();
    }
    graph
}

fn two_agent_manager() -> SharedWeightManager {
    WeightManager::new(WeightConfig {
        initial_agents: vec!["a1".into(), "a2".into()],
        ..Default::default()
    })
    .shared()
}

async fn injected_setup() -> (Graph, String, SharedWeightManager) {
    let weights = two_agent_manager();
    {
        let manager = weights.read().await;
        assert!((manager.weight("a1").unwrap() - 0.5).abs() < TOLERANCE);
        assert!((manager.weight("a2").unwrap() - 0.5).abs() < TOLERANCE);
    }

    let mut graph = trading_graph();
    let mut integrator = GraphIntegrator::new(
        weights.clone(),
        Arc::new(LayerManager::new()),
        ReinjectionPolicy::Reject,
    );
    let node = integrator
        .integrate_with_graph(Some(&mut graph), "consensus")
        .unwrap();
    (graph, node, weights)
}

#[tokio::test]
async fn equal_errors_give_midpoint_decision() {
    let (graph, node, weights) = injected_setup().await;
    let record = InvocationRecord::new()
        .with_predictions([("a1", 10.0), ("a2", 12.0)])
        .with_actual_value(11.0);

    let result = graph.invoke(&node, record).await.unwrap().result.unwrap();
    assert!(result.has_weights);
    assert!((result.weighted_decision.unwrap() - 11.0).abs() < TOLERANCE);

    let manager = weights.read().await;
    assert!((manager.weight("a1").unwrap() - 0.5).abs() < TOLERANCE);
    assert!((manager.weight("a2").unwrap() - 0.5).abs() < TOLERANCE);
}

#[tokio::test]
async fn closer_agent_gains_weight() {
    let (graph, node, weights) = injected_setup().await;
    let record = InvocationRecord::new()
        .with_predictions([("a1", 10.0), ("a2", 14.0)])
        .with_actual_value(10.0);

    graph.invoke(&node, record).await.unwrap();

    let current = weights.read().await.current_weights();
    assert!(current["a1"] > current["a2"]);
    assert!((current.values().sum::<f64>() - 1.0).abs() < TOLERANCE);

    // the next call reflects the adapted weights
    let record = InvocationRecord::new().with_predictions([("a1", 10.0), ("a2", 14.0)]);
    let result = graph.invoke(&node, record).await.unwrap().result.unwrap();
    assert!(result.weighted_decision.unwrap() < 12.0);
}

#[tokio::test]
async fn price_scale_errors_keep_ordering() {
    let (graph, node, weights) = injected_setup().await;
    for (a1, a2, actual) in [(60.0, 110.0, 10.0), (20_500.0, 31_000.0, 20_000.0)] {
        let record = InvocationRecord::new()
            .with_predictions([("a1", a1), ("a2", a2)])
            .with_actual_value(actual);
        graph.invoke(&node, record).await.unwrap();

        let current = weights.read().await.current_weights();
        assert!(current["a1"] > current["a2"], "{current:?}");
        assert!((current.values().sum::<f64>() - 1.0).abs() < TOLERANCE);
    }
}

#[test]
fn integration_rejects_missing_graph_and_unknown_target() {
    let mut integrator = GraphIntegrator::new(
        two_agent_manager(),
        Arc::new(LayerManager::new()),
        ReinjectionPolicy::Reject,
    );

    let missing = integrator.integrate_with_graph(None, "x");
    assert!(matches!(missing, Err(AdaptiveError::InvalidArgument(_))));

    let mut graph = trading_graph();
    let unknown = integrator.integrate_with_graph(Some(&mut graph), "nonexistent");
    assert!(matches!(unknown, Err(AdaptiveError::InvalidArgument(_))));
    assert_eq!(graph.node_count(), 6);
}

#[tokio::test]
async fn records_without_predictions_pass_through() {
    let (graph, node, weights) = injected_setup().await;
    let input = json!({
        "market_data": {"symbol": "EURUSD", "price": 1.0842},
        "actual_value": 1.09,
        "messages": [{"role": "assistant", "content": "macro report"}],
        "trade_date": "2024-01-05"
    });

    let record = InvocationRecord::from_json(input.clone()).unwrap();
    let output = graph.invoke(&node, record).await.unwrap().to_json();

    let mut expected = input.as_object().unwrap().clone();
    expected.insert("has_weights".into(), json!(false));
    expected.insert("weighted_decision".into(), json!(null));
    expected.insert("agent_weights".into(), json!({}));
    expected.insert("weighted_predictions".into(), json!({}));
    expected.insert("message".into(), output["message"].clone());
    assert_eq!(output, json!(expected));

    assert_eq!(weights.read().await.history_len(), 0);
}

#[tokio::test]
async fn repeated_calls_without_outcome_keep_weights() {
    let (graph, node, weights) = injected_setup().await;
    let before = weights.read().await.current_weights();

    for step in 0..10 {
        let record = InvocationRecord::new()
            .with_predictions([("a1", 10.0 + step as f64), ("a2", 14.0)]);
        graph.invoke(&node, record).await.unwrap();
        assert_eq!(weights.read().await.current_weights(), before);
    }
}

#[tokio::test]
async fn malformed_payload_fails_cleanly() {
    let (graph, node, weights) = injected_setup().await;

    let parsed = InvocationRecord::from_json(json!({"predictions": {"a1": "bullish"}}));
    assert!(matches!(parsed, Err(AdaptiveError::InvalidInput(_))));

    let record = InvocationRecord::new()
        .with_predictions([("a1", f64::INFINITY), ("a2", 1.0)])
        .with_actual_value(1.0);
    let outcome = graph.invoke(&node, record).await;
    assert!(matches!(outcome, Err(AdaptiveError::InvalidInput(_))));
    assert_eq!(weights.read().await.history_len(), 0);
}

#[tokio::test]
async fn layered_decision_through_graph() {
    let weights = WeightManager::new(WeightConfig {
        initial_agents: vec![
            "macro_analyst".into(),
            "quantitative_analyst".into(),
            "technical_analyst".into(),
            "news_analyst".into(),
        ],
        ..Default::default()
    })
    .shared();
    let mut layers = LayerManager::new();
    layers
        .register_layer("strategic", ["macro_analyst", "quantitative_analyst"], None)
        .unwrap();
    layers.register_layer("tactical", ["technical_analyst"], None).unwrap();

    let mut graph = trading_graph();
    let mut integrator =
        GraphIntegrator::new(weights.clone(), Arc::new(layers), ReinjectionPolicy::Replace);
    let injected = integrator.integrate_all(Some(&mut graph), None).unwrap();
    assert_eq!(injected.len(), 3);

    let record = InvocationRecord::new().with_predictions([
        ("macro_analyst", 0.2),
        ("quantitative_analyst", 0.4),
        ("technical_analyst", 0.6),
        ("news_analyst", 1.2),
    ]);
    let result = graph.invoke(&injected[0], record).await.unwrap().result.unwrap();

    let names: Vec<&str> = result.layer_decisions.iter().map(|d| d.layer.as_str()).collect();
    assert_eq!(names, vec!["strategic", "tactical", "default"]);
    assert!((result.weighted_decision.unwrap() - 0.7).abs() < TOLERANCE);
}
