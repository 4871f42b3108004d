use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::core::error::{AdaptiveError, AdaptiveResult};

pub type AgentId = String;

/// Agent identifier -> numeric prediction.
pub type Predictions = BTreeMap<AgentId, f64>;

/// Agent identifier -> normalized weight.
pub type WeightVector = BTreeMap<AgentId, f64>;

const PREDICTIONS: &str = "predictions";
const MARKET_DATA: &str = "market_data";
const ACTUAL_VALUE: &str = "actual_value";

/// Per-call payload exchanged with the graph.
///
/// `market_data` and `extra` are carried through untouched; only
/// `predictions` and `actual_value` are ever read by the weighting core.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationRecord {
    pub predictions: Option<Predictions>,
    pub market_data: Option<Value>,
    pub actual_value: Option<f64>,
    pub extra: Map<String, Value>,
    pub result: Option<CalculatorResult>,
}

/// Decision produced for one resolved layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDecision {
    pub layer: String,
    pub decision: f64,
    pub share: f64,
    pub agents: Vec<AgentId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalculatorResult {
    pub weighted_decision: Option<f64>,
    pub agent_weights: WeightVector,
    pub weighted_predictions: Predictions,
    pub has_weights: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub raw_weights: WeightVector,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layer_decisions: Vec<LayerDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CalculatorResult {
    /// Augmentation applied when a call carries no predictions.
    pub fn skipped() -> Self {
        Self {
            message: Some("no predictions supplied; weighting skipped".to_string()),
            ..Default::default()
        }
    }
}

impl InvocationRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_predictions<I, K>(mut self, predictions: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<AgentId>,
    {
        self.predictions = Some(
            predictions
                .into_iter()
                .map(|(agent, value)| (agent.into(), value))
                .collect(),
        );
        self
    }

    pub fn with_actual_value(mut self, actual_value: f64) -> Self {
        self.actual_value = Some(actual_value);
        self
    }

    pub fn with_market_data(mut self, market_data: Value) -> Self {
        self.market_data = Some(market_data);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn has_predictions(&self) -> bool {
        self.predictions.as_ref().is_some_and(|p| !p.is_empty())
    }

    /// Parses an untyped payload, rejecting structurally malformed
    /// `predictions` or `actual_value`. Unknown keys land in `extra`.
    pub fn from_json(value: Value) -> AdaptiveResult<Self> {
        let Value::Object(mut fields) = value else {
            return Err(AdaptiveError::InvalidInput(
                "invocation record must be a JSON object".to_string(),
            ));
        };

        let predictions = match fields.remove(PREDICTIONS) {
            None | Some(Value::Null) => None,
            Some(Value::Object(raw)) => {
                let mut parsed = Predictions::new();
                for (agent, value) in raw {
                    let number = value.as_f64().ok_or_else(|| {
                        AdaptiveError::InvalidInput(format!(
                            "prediction for agent {agent} is not numeric: {value}"
                        ))
                    })?;
                    parsed.insert(agent, number);
                }
                Some(parsed)
            }
            Some(other) => {
                return Err(AdaptiveError::InvalidInput(format!(
                    "predictions must be a mapping, got {other}"
                )))
            }
        };

        let actual_value = match fields.remove(ACTUAL_VALUE) {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.as_f64().ok_or_else(|| {
                AdaptiveError::InvalidInput(format!("actual_value is not numeric: {value}"))
            })?),
        };

        let record = Self {
            predictions,
            market_data: fields.remove(MARKET_DATA),
            actual_value,
            extra: fields,
            result: None,
        };
        record.validate()?;
        Ok(record)
    }

    /// Flattens the record and any calculator output into one JSON object.
    pub fn to_json(&self) -> Value {
        let mut out = self.extra.clone();
        if let Some(predictions) = &self.predictions {
            out.insert(PREDICTIONS.to_string(), json!(predictions));
        }
        if let Some(market_data) = &self.market_data {
            out.insert(MARKET_DATA.to_string(), market_data.clone());
        }
        if let Some(actual_value) = self.actual_value {
            out.insert(ACTUAL_VALUE.to_string(), json!(actual_value));
        }
        if let Some(result) = &self.result {
            if let Ok(Value::Object(fields)) = serde_json::to_value(result) {
                out.extend(fields);
            }
        }
        Value::Object(out)
    }

    pub fn validate(&self) -> AdaptiveResult<()> {
        if let Some(predictions) = &self.predictions {
            validate_predictions(predictions)?;
        }
        if let Some(actual_value) = self.actual_value {
            validate_actual(actual_value)?;
        }
        Ok(())
    }
}

pub fn validate_predictions(predictions: &Predictions) -> AdaptiveResult<()> {
    for (agent, value) in predictions {
        if !value.is_finite() {
            return Err(AdaptiveError::InvalidInput(format!(
                "prediction for agent {agent} is not a finite number: {value}"
            )));
        }
    }
    Ok(())
}

pub fn validate_actual(actual_value: f64) -> AdaptiveResult<()> {
    if actual_value.is_finite() {
        Ok(())
    } else {
        Err(AdaptiveError::InvalidInput(format!(
            "actual_value is not a finite number: {actual_value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_splits_known_fields() {
        let record = InvocationRecord::from_json(json!({
            "predictions": {"a1": 10.0, "a2": 12},
            "market_data": {"symbol": "EURUSD"},
            "actual_value": 11.0,
            "messages": ["hello"]
        }))
        .unwrap();

        let predictions = record.predictions.as_ref().unwrap();
        assert_eq!(predictions["a2"], 12.0);
        assert_eq!(record.actual_value, Some(11.0));
        assert_eq!(record.market_data, Some(json!({"symbol": "EURUSD"})));
        assert_eq!(record.extra["messages"], json!(["hello"]));
    }

    #[test]
    fn test_from_json_rejects_malformed_predictions() {
        let non_numeric = InvocationRecord::from_json(json!({"predictions": {"a1": "up"}}));
        assert!(matches!(non_numeric, Err(AdaptiveError::InvalidInput(_))));

        let not_a_mapping = InvocationRecord::from_json(json!({"predictions": [1.0, 2.0]}));
        assert!(matches!(not_a_mapping, Err(AdaptiveError::InvalidInput(_))));

        let bad_actual = InvocationRecord::from_json(json!({"actual_value": "11"}));
        assert!(matches!(bad_actual, Err(AdaptiveError::InvalidInput(_))));
    }

    #[test]
    fn test_null_fields_are_absent() {
        let record = InvocationRecord::from_json(json!({
            "predictions": null,
            "actual_value": null
        }))
        .unwrap();

        assert!(record.predictions.is_none());
        assert!(record.actual_value.is_none());
        assert!(!record.has_predictions());
    }

    #[test]
    fn test_validate_rejects_non_finite() {
        let record = InvocationRecord::new().with_predictions([("a1", f64::NAN)]);
        assert!(matches!(record.validate(), Err(AdaptiveError::InvalidInput(_))));

        let record = InvocationRecord::new().with_actual_value(f64::INFINITY);
        assert!(matches!(record.validate(), Err(AdaptiveError::InvalidInput(_))));
    }

    #[test]
    fn test_to_json_keeps_pass_through_fields() {
        let input = json!({
            "market_data": {"price": 1.25},
            "trade_date": "2024-01-05"
        });
        let record = InvocationRecord::from_json(input.clone()).unwrap();
        assert_eq!(record.to_json(), input);
    }
}
