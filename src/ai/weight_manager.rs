// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ADAPTIVE WEIGHT MANAGER - EXPONENTIALLY WEIGHTED AGENT TRUST
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//
// Every registered agent carries a weight; the weights always sum to 1.0.
// When the realized value of a predicted quantity becomes known, each
// agent's weight is scaled by exp(-learning_rate * error) and the vector
// is re-normalized, so agents that were closer gain relative weight.
//
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::record::{validate_actual, validate_predictions, AgentId, Predictions, WeightVector};
use crate::core::error::{AdaptiveError, AdaptiveResult};

/// Weight manager shared between graph nodes. The lock is the mutual
/// exclusion boundary around `register`/`update`.
pub type SharedWeightManager = Arc<RwLock<WeightManager>>;

/// How a single prediction's deviation from the outcome is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMetric {
    #[default]
    Absolute,
    Squared,
    /// Absolute error relative to the outcome; falls back to `|prediction|`
    /// when the outcome is zero.
    Relative,
}

impl ErrorMetric {
    pub fn error(&self, prediction: f64, actual: f64) -> f64 {
        let deviation = (prediction - actual).abs();
        match self {
            ErrorMetric::Absolute => deviation,
            ErrorMetric::Squared => deviation * deviation,
            ErrorMetric::Relative => {
                if actual != 0.0 {
                    deviation / actual.abs()
                } else {
                    prediction.abs()
                }
            }
        }
    }
}

impl fmt::Display for ErrorMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorMetric::Absolute => write!(f, "absolute"),
            ErrorMetric::Squared => write!(f, "squared"),
            ErrorMetric::Relative => write!(f, "relative"),
        }
    }
}

impl FromStr for ErrorMetric {
    type Err = AdaptiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "absolute" | "abs" => Ok(ErrorMetric::Absolute),
            "squared" | "sq" => Ok(ErrorMetric::Squared),
            "relative" | "mape" => Ok(ErrorMetric::Relative),
            other => Err(AdaptiveError::InvalidArgument(format!(
                "unknown error metric: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightConfig {
    /// Larger values adapt faster but are noisier.
    pub learning_rate: f64,
    pub error_metric: ErrorMetric,
    /// Lower bound on any weight after an update.
    pub min_weight: f64,
    /// Upper bound on any weight after an update; 1.0 disables the cap.
    pub max_weight: f64,
    /// Number of recent errors kept per agent.
    pub error_window: usize,
    /// Number of weight updates kept in history.
    pub history_capacity: usize,
    pub initial_agents: Vec<AgentId>,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.3,
            error_metric: ErrorMetric::Absolute,
            min_weight: 1e-6,
            max_weight: 1.0,
            error_window: 20,
            history_capacity: 1000,
            initial_agents: Vec::new(),
        }
    }
}

/// Per-agent observation record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentStats {
    pub observations: u64,
    pub last_error: Option<f64>,
    pub recent_errors: VecDeque<f64>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl AgentStats {
    fn observe(&mut self, error: f64, window: usize, at: DateTime<Utc>) {
        self.observations += 1;
        self.last_error = Some(error);
        self.recent_errors.push_back(error);
        while self.recent_errors.len() > window.max(1) {
            self.recent_errors.pop_front();
        }
        self.last_updated = Some(at);
    }

    /// Mean of the recent error window, 1.0 before any observation.
    pub fn average_error(&self) -> f64 {
        if self.recent_errors.is_empty() {
            1.0
        } else {
            self.recent_errors.iter().sum::<f64>() / self.recent_errors.len() as f64
        }
    }
}

#[derive(Debug, Clone)]
struct AgentRecord {
    weight: f64,
    stats: AgentStats,
}

impl AgentRecord {
    fn new(weight: f64) -> Self {
        Self {
            weight,
            stats: AgentStats::default(),
        }
    }
}

/// One applied `update` call.
#[derive(Debug, Clone, Serialize)]
pub struct WeightUpdate {
    pub timestamp: DateTime<Utc>,
    pub actual_value: f64,
    pub errors: BTreeMap<AgentId, f64>,
    pub weights_before: WeightVector,
    pub weights_after: WeightVector,
}

#[derive(Debug, Clone)]
pub struct WeightManager {
    config: WeightConfig,
    agents: BTreeMap<AgentId, AgentRecord>,
    history: VecDeque<WeightUpdate>,
}

impl WeightManager {
    pub fn new(config: WeightConfig) -> Self {
        let initial_agents = config.initial_agents.clone();
        let mut manager = Self {
            config,
            agents: BTreeMap::new(),
            history: VecDeque::new(),
        };
        for agent in initial_agents {
            manager.register(agent);
        }

        tracing::info!(
            "⚖️  Weight manager ready: {} agents, learning rate {}, {} error",
            manager.agents.len(),
            manager.config.learning_rate,
            manager.config.error_metric
        );
        manager
    }

    pub fn shared(self) -> SharedWeightManager {
        Arc::new(RwLock::new(self))
    }

    pub fn config(&self) -> &WeightConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn contains(&self, agent: &str) -> bool {
        self.agents.contains_key(agent)
    }

    pub fn agents(&self) -> Vec<AgentId> {
        self.agents.keys().cloned().collect()
    }

    /// Adds an agent at weight `1/N`, scaling the others by `(N-1)/N`.
    /// Returns `false` when the agent was already registered.
    pub fn register(&mut self, agent: impl Into<AgentId>) -> bool {
        let agent = agent.into();
        if self.agents.contains_key(&agent) {
            return false;
        }

        let n = (self.agents.len() + 1) as f64;
        for record in self.agents.values_mut() {
            record.weight *= (n - 1.0) / n;
        }
        self.agents.insert(agent.clone(), AgentRecord::new(1.0 / n));
        self.normalize();

        tracing::info!("📝 Registered agent {} ({} total)", agent, self.agents.len());
        true
    }

    /// Drops an agent and re-normalizes the remainder.
    pub fn remove(&mut self, agent: &str) -> bool {
        if self.agents.remove(agent).is_none() {
            return false;
        }
        self.normalize();
        tracing::info!("Removed agent {} ({} remaining)", agent, self.agents.len());
        true
    }

    /// Snapshot copy of the weight vector.
    pub fn current_weights(&self) -> WeightVector {
        self.agents
            .iter()
            .map(|(agent, record)| (agent.clone(), record.weight))
            .collect()
    }

    pub fn weight(&self, agent: &str) -> Option<f64> {
        self.agents.get(agent).map(|record| record.weight)
    }

    /// The weight vector as it would look if every unseen agent in `agents`
    /// were registered now. Does not mutate.
    pub fn provisional_weights<'a, I>(&self, agents: I) -> WeightVector
    where
        I: IntoIterator<Item = &'a str>,
    {
        let unseen: BTreeSet<&str> = agents
            .into_iter()
            .filter(|agent| !self.agents.contains_key(*agent))
            .collect();
        let mut weights = self.current_weights();
        if unseen.is_empty() {
            return weights;
        }

        let total = (self.agents.len() + unseen.len()) as f64;
        let scale = self.agents.len() as f64 / total;
        for weight in weights.values_mut() {
            *weight *= scale;
        }
        for agent in unseen {
            weights.insert(agent.to_string(), 1.0 / total);
        }
        weights
    }

    /// Applies `w[a] *= exp(-λ · error[a])` for every predicting agent,
    /// re-normalizes and clamps into the configured bounds. A missing outcome
    /// leaves the weights untouched.
    ///
    /// Inputs are validated before any state changes, so a rejected call
    /// never leaves a partial update behind.
    pub fn update(
        &mut self,
        predictions: &Predictions,
        actual_value: Option<f64>,
    ) -> AdaptiveResult<Option<WeightUpdate>> {
        validate_predictions(predictions)?;
        let Some(actual) = actual_value else {
            tracing::debug!("No actual value supplied, weights unchanged");
            return Ok(None);
        };
        validate_actual(actual)?;
        if predictions.is_empty() {
            return Ok(None);
        }

        for agent in predictions.keys() {
            if !self.agents.contains_key(agent) {
                self.register(agent.clone());
            }
        }

        let weights_before = self.current_weights();
        let learning_rate = self.config.learning_rate;
        let window = self.config.error_window;
        let now = Utc::now();
        let mut errors = BTreeMap::new();

        // Work on log-weights so large errors cannot underflow every factor.
        let mut log_weights: BTreeMap<AgentId, f64> = self
            .agents
            .iter()
            .map(|(agent, record)| (agent.clone(), record.weight.ln()))
            .collect();

        for (agent, &prediction) in predictions {
            let error = self.config.error_metric.error(prediction, actual);
            if learning_rate > 0.0 {
                if let Some(log_weight) = log_weights.get_mut(agent) {
                    *log_weight -= learning_rate * error;
                }
            }
            if let Some(record) = self.agents.get_mut(agent) {
                record.stats.observe(error, window, now);
            }
            errors.insert(agent.clone(), error);
        }

        let peak = log_weights.values().copied().fold(f64::NEG_INFINITY, f64::max);
        for (agent, record) in self.agents.iter_mut() {
            record.weight = match log_weights.get(agent) {
                Some(&log_weight) if peak.is_finite() && !log_weight.is_nan() => {
                    (log_weight - peak).exp()
                }
                _ => 0.0,
            };
        }
        self.normalize();
        self.apply_bounds();

        let update = WeightUpdate {
            timestamp: now,
            actual_value: actual,
            errors,
            weights_before,
            weights_after: self.current_weights(),
        };

        tracing::debug!(
            "🔧 Weights updated against actual {:.6}: {:?}",
            actual,
            update.weights_after
        );

        self.history.push_back(update.clone());
        while self.history.len() > self.config.history_capacity.max(1) {
            self.history.pop_front();
        }

        Ok(Some(update))
    }

    /// Back to a uniform distribution; statistics and history are cleared.
    pub fn reset(&mut self) {
        let n = self.agents.len() as f64;
        for record in self.agents.values_mut() {
            *record = AgentRecord::new(1.0 / n);
        }
        self.history.clear();
        tracing::warn!("🔄 Weights reset to uniform over {} agents", self.agents.len());
    }

    pub fn agent_stats(&self, agent: &str) -> Option<AgentStats> {
        self.agents.get(agent).map(|record| record.stats.clone())
    }

    /// Rolling mean error for an agent, 1.0 when nothing has been observed.
    pub fn agent_error(&self, agent: &str) -> f64 {
        self.agents
            .get(agent)
            .map(|record| record.stats.average_error())
            .unwrap_or(1.0)
    }

    pub fn history(&self) -> impl Iterator<Item = &WeightUpdate> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Clamps every weight into `[min_weight, max_weight]` and spreads the
    /// remaining mass over the unclamped agents, repeating until stable.
    /// Bounds that no distribution summing to 1 can satisfy are ignored.
    fn apply_bounds(&mut self) {
        let n = self.agents.len() as f64;
        let (floor, cap) = (self.config.min_weight, self.config.max_weight);
        if n == 0.0 || floor * n > 1.0 || cap * n < 1.0 {
            return;
        }

        let mut pinned: BTreeMap<AgentId, f64> = BTreeMap::new();
        for _ in 0..self.agents.len() {
            let pinned_mass: f64 = pinned.values().sum();
            let free_mass: f64 = self
                .agents
                .iter()
                .filter(|(agent, _)| !pinned.contains_key(*agent))
                .map(|(_, record)| record.weight)
                .sum();
            let free_count = self.agents.len() - pinned.len();
            let target = (1.0 - pinned_mass).max(0.0);

            let mut changed = false;
            for (agent, record) in self.agents.iter_mut() {
                if let Some(&bound) = pinned.get(agent) {
                    record.weight = bound;
                    continue;
                }
                record.weight = if free_mass > 0.0 {
                    record.weight / free_mass * target
                } else {
                    target / free_count as f64
                };
                if record.weight < floor {
                    pinned.insert(agent.clone(), floor);
                    changed = true;
                } else if record.weight > cap {
                    pinned.insert(agent.clone(), cap);
                    changed = true;
                }
            }
            if !changed {
                return;
            }
        }
        for (agent, &bound) in &pinned {
            if let Some(record) = self.agents.get_mut(agent) {
                record.weight = bound;
            }
        }
    }

    fn normalize(&mut self) {
        if self.agents.is_empty() {
            return;
        }

        let total: f64 = self.agents.values().map(|record| record.weight).sum();
        if total > 0.0 && total.is_finite() {
            for record in self.agents.values_mut() {
                record.weight /= total;
            }
        } else {
            tracing::warn!("⚠️  Weight vector degenerate (sum {}), resetting to uniform", total);
            let uniform = 1.0 / self.agents.len() as f64;
            for record in self.agents.values_mut() {
                record.weight = uniform;
            }
        }
    }

    pub fn format_report(&self) -> String {
        let mut report = String::from(
            "\n┌────────────────────────────────────────────────────────────┐\n\
             │         ⚖️  AGENT WEIGHTS                                   │\n\
             ├────────────────────────────────────────────────────────────┤\n",
        );
        for (agent, record) in &self.agents {
            report.push_str(&format!(
                "│ {:<28} {:>7.2}%   avg err {:>10.6}   │\n",
                agent,
                record.weight * 100.0,
                record.stats.average_error()
            ));
        }
        report.push_str(&format!(
            "├────────────────────────────────────────────────────────────┤\n\
             │ Updates recorded: {:<41}│\n\
             └────────────────────────────────────────────────────────────┘",
            self.history.len()
        ));
        report
    }
}

impl Default for WeightManager {
    fn default() -> Self {
        Self::new(WeightConfig::default())
    }
}
