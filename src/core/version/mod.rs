use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::core::store::{Store, VersionRecord, now_ms};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    /// USD per million input tokens.
    pub input_per_mtok: f64,
    /// USD per million output tokens.
    pub output_per_mtok: f64,
}

impl Pricing {
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_mtok + output_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<Pricing>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wall_clock_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,
}

/// Everything that determines how an agent behaves. Frozen into an `AgentVersion` on publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub model: ModelSelection,
    pub instructions: String,
    /// Enabled tools in the order they are presented to the model.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub budget: BudgetOverrides,
}

impl AgentConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.provider.trim().is_empty() || self.model.model.trim().is_empty() {
            return Err(anyhow!("model.provider and model.model are required"));
        }
        let mut seen = HashSet::new();
        for tool in &self.tools {
            if tool.trim().is_empty() {
                return Err(anyhow!("tool names must not be empty"));
            }
            if !seen.insert(tool.as_str()) {
                return Err(anyhow!("tool '{}' is listed more than once", tool));
            }
        }
        if self.budget.max_turns == Some(0) {
            return Err(anyhow!("budget.max_turns must be at least 1"));
        }
        Ok(())
    }
}

/// Immutable configuration snapshot. `config_json` is the exact persisted text.
#[derive(Debug, Clone, Serialize)]
pub struct AgentVersion {
    pub version_id: String,
    pub agent_id: String,
    pub config: AgentConfig,
    #[serde(skip)]
    pub config_json: String,
    pub created_at: i64,
}

impl AgentVersion {
    fn from_record(rec: VersionRecord) -> Result<Self> {
        let config = serde_json::from_str(&rec.config_json)?;
        Ok(Self {
            version_id: rec.version_id,
            agent_id: rec.agent_id,
            config,
            config_json: rec.config_json,
            created_at: rec.created_at,
        })
    }
}

/// Publishes and reads immutable agent versions. Reads are served from a cache after the
/// first load since a published version never changes.
pub struct VersionStore {
    store: Store,
    cache: RwLock<HashMap<String, Arc<AgentVersion>>>,
}

impl VersionStore {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn publish(&self, agent_id: &str, config: &AgentConfig) -> Result<String> {
        let agent_id = agent_id.trim();
        if agent_id.is_empty() {
            return Err(anyhow!("agent id is required"));
        }
        config.validate()?;

        let version_id = uuid::Uuid::new_v4().to_string();
        let config_json = serde_json::to_string(config)?;
        let created_at = now_ms();
        self.store
            .insert_version(&version_id, agent_id, &config_json, created_at)
            .await?;

        let version = AgentVersion {
            version_id: version_id.clone(),
            agent_id: agent_id.to_string(),
            config: config.clone(),
            config_json,
            created_at,
        };
        self.cache
            .write()
            .await
            .insert(version_id.clone(), Arc::new(version));

        info!("Published agent [{}] version {}", agent_id, version_id);
        Ok(version_id)
    }

    pub async fn get(&self, version_id: &str) -> Result<Option<Arc<AgentVersion>>> {
        if let Some(hit) = self.cache.read().await.get(version_id) {
            return Ok(Some(hit.clone()));
        }
        let Some(rec) = self.store.get_version(version_id).await? else {
            return Ok(None);
        };
        let version = Arc::new(AgentVersion::from_record(rec)?);
        self.cache
            .write()
            .await
            .insert(version_id.to_string(), version.clone());
        Ok(Some(version))
    }

    pub async fn list_for_agent(&self, agent_id: &str) -> Result<Vec<AgentVersion>> {
        self.store
            .list_versions_for_agent(agent_id)
            .await?
            .into_iter()
            .map(AgentVersion::from_record)
            .collect()
    }

    pub async fn latest_for_agent(&self, agent_id: &str) -> Result<Option<AgentVersion>> {
        self.store
            .latest_version_for_agent(agent_id)
            .await?
            .map(AgentVersion::from_record)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config(instructions: &str) -> AgentConfig {
        AgentConfig {
            model: ModelSelection {
                provider: "scripted".into(),
                model: "test-model".into(),
                temperature: None,
                pricing: None,
            },
            instructions: instructions.into(),
            tools: vec!["search".into(), "summarize".into()],
            budget: BudgetOverrides::default(),
        }
    }

    #[tokio::test]
    async fn edits_publish_new_versions_and_old_ones_stay_identical() {
        let store = Store::open_in_memory().unwrap();
        let versions = VersionStore::new(store.clone());

        let v1 = versions.publish("agent-a", &sample_config("be terse")).await.unwrap();
        let pinned = versions.get(&v1).await.unwrap().unwrap();
        let v2 = versions.publish("agent-a", &sample_config("be verbose")).await.unwrap();
        assert_ne!(v1, v2);

        // A cold reader (fresh cache) still sees the original bytes for v1.
        let cold = VersionStore::new(store);
        let reread = cold.get(&v1).await.unwrap().unwrap();
        assert_eq!(reread.config_json, pinned.config_json);
        assert_eq!(reread.config.instructions, "be terse");

        let latest = cold.latest_for_agent("agent-a").await.unwrap().unwrap();
        assert_eq!(latest.version_id, v2);
        assert_eq!(cold.list_for_agent("agent-a").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn publish_rejects_invalid_configs() {
        let versions = VersionStore::new(Store::open_in_memory().unwrap());
        let mut dup = sample_config("x");
        dup.tools.push("search".into());
        assert!(versions.publish("agent", &dup).await.is_err());
        assert!(versions.publish("  ", &sample_config("x")).await.is_err());

        let mut no_model = sample_config("x");
        no_model.model.model.clear();
        assert!(versions.publish("agent", &no_model).await.is_err());
    }

    #[tokio::test]
    async fn unknown_version_is_none() {
        let versions = VersionStore::new(Store::open_in_memory().unwrap());
        assert!(versions.get("missing").await.unwrap().is_none());
    }

    #[test]
    fn config_parses_from_toml() {
        let cfg = AgentConfig::from_toml_str(
            r#"
            instructions = "You research things."
            tools = ["search"]

            [model]
            provider = "openai"
            model = "gpt-4o-mini"

            [model.pricing]
            input_per_mtok = 0.15
            output_per_mtok = 0.6

            [budget]
            max_turns = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.budget.max_turns, Some(5));
        let pricing = cfg.model.pricing.unwrap();
        assert!((pricing.cost(1_000_000, 0) - 0.15).abs() < 1e-9);
    }
}
