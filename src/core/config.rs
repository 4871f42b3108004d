use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;

use crate::ai::layer_manager::{Aggregation, CrossLayerRule, LayerManager, LayerSpec};
use crate::ai::weight_manager::{ErrorMetric, WeightConfig, WeightManager};
use crate::graph::integrator::{IntegrationConfig, ReinjectionPolicy};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub weights: WeightConfig,
    pub layers: LayersConfig,
    pub integration: IntegrationConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayersConfig {
    pub definitions: Vec<LayerSpec>,
    pub cross_layer_rule: CrossLayerRule,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let defaults = WeightConfig::default();
        let config = Config {
            weights: WeightConfig {
                learning_rate: env::var("ADAPTIVE_LEARNING_RATE")
                    .unwrap_or_else(|_| defaults.learning_rate.to_string())
                    .parse()
                    .unwrap_or(defaults.learning_rate),
                error_metric: parse_enum("ADAPTIVE_ERROR_METRIC", ErrorMetric::default()),
                min_weight: env::var("ADAPTIVE_MIN_WEIGHT")
                    .unwrap_or_else(|_| defaults.min_weight.to_string())
                    .parse()
                    .unwrap_or(defaults.min_weight),
                max_weight: env::var("ADAPTIVE_MAX_WEIGHT")
                    .unwrap_or_else(|_| defaults.max_weight.to_string())
                    .parse()
                    .unwrap_or(defaults.max_weight),
                error_window: env::var("ADAPTIVE_ERROR_WINDOW")
                    .unwrap_or_else(|_| defaults.error_window.to_string())
                    .parse()
                    .unwrap_or(defaults.error_window),
                history_capacity: env::var("ADAPTIVE_HISTORY_CAPACITY")
                    .unwrap_or_else(|_| defaults.history_capacity.to_string())
                    .parse()
                    .unwrap_or(defaults.history_capacity),
                initial_agents: env::var("ADAPTIVE_INITIAL_AGENTS")
                    .map(|raw| parse_list(&raw))
                    .unwrap_or_default(),
            },
            layers: LayersConfig {
                definitions: match env::var("ADAPTIVE_LAYERS") {
                    Ok(raw) => parse_layers(&raw).context("invalid ADAPTIVE_LAYERS")?,
                    Err(_) => Vec::new(),
                },
                cross_layer_rule: parse_enum("ADAPTIVE_CROSS_LAYER_RULE", CrossLayerRule::default()),
            },
            integration: IntegrationConfig {
                reinjection_policy: parse_enum(
                    "ADAPTIVE_REINJECTION_POLICY",
                    ReinjectionPolicy::default(),
                ),
                target_nodes: env::var("ADAPTIVE_TARGET_NODES")
                    .map(|raw| parse_list(&raw))
                    .unwrap_or_default(),
            },
            monitoring: MonitoringConfig {
                log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML/JSON/YAML file; `ADAPTIVE__SECTION__KEY` variables
    /// override file values.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("ADAPTIVE").separator("__"))
            .build()
            .with_context(|| format!("failed to read config file {path}"))?;

        let config: Config = settings
            .try_deserialize()
            .with_context(|| format!("malformed config file {path}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let weights = &self.weights;
        if !weights.learning_rate.is_finite() || weights.learning_rate < 0.0 {
            bail!("learning rate must be a non-negative number, got {}", weights.learning_rate);
        }
        if !(0.0..1.0).contains(&weights.min_weight) {
            bail!("min weight must lie in [0, 1), got {}", weights.min_weight);
        }
        if !(weights.max_weight > 0.0 && weights.max_weight <= 1.0) {
            bail!("max weight must lie in (0, 1], got {}", weights.max_weight);
        }
        if weights.min_weight >= weights.max_weight {
            bail!(
                "min weight {} must be below max weight {}",
                weights.min_weight,
                weights.max_weight
            );
        }
        if weights.history_capacity == 0 {
            bail!("history capacity must be at least 1");
        }
        if weights.error_window == 0 {
            bail!("error window must be at least 1");
        }
        Ok(())
    }

    pub fn weight_manager(&self) -> WeightManager {
        WeightManager::new(self.weights.clone())
    }

    pub fn layer_manager(&self) -> Result<LayerManager> {
        LayerManager::from_specs(&self.layers.definitions, self.layers.cross_layer_rule)
            .context("invalid layer definitions")
    }
}

fn parse_enum<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring unrecognized {}={}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

/// `name=agent,agent[:aggregation];name=...`
fn parse_layers(raw: &str) -> Result<Vec<LayerSpec>> {
    let mut specs = Vec::new();
    for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((name, rest)) = entry.split_once('=') else {
            bail!("layer entry {entry:?} is missing '='");
        };
        let (agents, aggregation) = match rest.split_once(':') {
            Some((agents, rule)) => (agents, rule.parse::<Aggregation>()?),
            None => (rest, Aggregation::default()),
        };
        specs.push(LayerSpec {
            name: name.trim().to_string(),
            agents: parse_list(agents),
            aggregation,
        });
    }
    Ok(specs)
}
