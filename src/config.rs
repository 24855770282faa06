use crate::error::{MentorError, Result};
use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MentorConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// TTLs and key shapes for the three engine caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_learner_ttl")]
    pub learner_context_ttl_secs: u64,
    #[serde(default = "default_similarity_ttl")]
    pub similarity_ttl_secs: u64,
    #[serde(default = "default_response_ttl")]
    pub response_ttl_secs: u64,
    /// Upper bound on entries per cache; the oldest insert is evicted on overflow.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Query prefix length used in the response cache key.
    #[serde(default = "default_response_key_chars")]
    pub response_key_chars: usize,
    /// Query prefix length used in the retrieval sub-result keys.
    #[serde(default = "default_retrieval_key_chars")]
    pub retrieval_key_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_size")]
    pub max_pool_size: usize,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_threshold")]
    pub size_threshold: usize,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
    /// Post-processing jobs held before new ones are dropped (and counted).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Similarity hits requested per query.
    #[serde(default = "default_result_count")]
    pub result_count: usize,
    /// Struggled-concept terms appended to the similarity query.
    #[serde(default = "default_enhance_terms")]
    pub enhance_terms: usize,
    #[serde(default = "default_peer_limit")]
    pub peer_limit: usize,
    #[serde(default)]
    pub include_prerequisites: bool,
    #[serde(default = "default_prerequisite_limit")]
    pub prerequisite_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_generation_timeout")]
    pub timeout_ms: u64,
    /// Overrides the provider's default model when set.
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub provider_type: ProviderType,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    #[default]
    Gemini,
    Openrouter,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the local graph, vector and session files.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_learner_ttl() -> u64 {
    300
}

fn default_similarity_ttl() -> u64 {
    600
}

fn default_response_ttl() -> u64 {
    120
}

fn default_max_entries() -> usize {
    10_000
}

fn default_response_key_chars() -> usize {
    50
}

fn default_retrieval_key_chars() -> usize {
    30
}

fn default_pool_size() -> usize {
    10
}

fn default_acquire_timeout() -> u64 {
    2_000
}

fn default_batch_threshold() -> usize {
    10
}

fn default_flush_interval() -> u64 {
    1_000
}

fn default_queue_capacity() -> usize {
    1_024
}

fn default_result_count() -> usize {
    5
}

fn default_enhance_terms() -> usize {
    2
}

fn default_peer_limit() -> usize {
    3
}

fn default_prerequisite_limit() -> usize {
    5
}

fn default_max_tokens() -> u32 {
    300
}

fn default_temperature() -> f32 {
    0.7
}

fn default_generation_timeout() -> u64 {
    15_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            learner_context_ttl_secs: default_learner_ttl(),
            similarity_ttl_secs: default_similarity_ttl(),
            response_ttl_secs: default_response_ttl(),
            max_entries: default_max_entries(),
            response_key_chars: default_response_key_chars(),
            retrieval_key_chars: default_retrieval_key_chars(),
        }
    }
}

impl CacheConfig {
    pub fn learner_context_ttl(&self) -> Duration {
        Duration::from_secs(self.learner_context_ttl_secs)
    }

    pub fn similarity_ttl(&self) -> Duration {
        Duration::from_secs(self.similarity_ttl_secs)
    }

    pub fn response_ttl(&self) -> Duration {
        Duration::from_secs(self.response_ttl_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: default_pool_size(),
            acquire_timeout_ms: default_acquire_timeout(),
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size_threshold: default_batch_threshold(),
            flush_interval_ms: default_flush_interval(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl BatchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            result_count: default_result_count(),
            enhance_terms: default_enhance_terms(),
            peer_limit: default_peer_limit(),
            include_prerequisites: false,
            prerequisite_limit: default_prerequisite_limit(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_ms: default_generation_timeout(),
            model: None,
        }
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_type: ProviderType::default(),
            api_key: None,
            base_url: None,
            default_model: None,
            timeout_secs: None,
        }
    }
}

impl MentorConfig {
    /// Reject knob values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_pool_size == 0 {
            return Err(MentorError::Configuration(
                "pool.max_pool_size must be at least 1".to_string(),
            ));
        }
        if self.batch.size_threshold == 0 {
            return Err(MentorError::Configuration(
                "batch.size_threshold must be at least 1".to_string(),
            ));
        }
        if self.batch.queue_capacity == 0 {
            return Err(MentorError::Configuration(
                "batch.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.cache.learner_context_ttl_secs == 0
            || self.cache.similarity_ttl_secs == 0
            || self.cache.response_ttl_secs == 0
        {
            return Err(MentorError::Configuration(
                "cache TTLs must be greater than zero".to_string(),
            ));
        }
        if self.cache.response_key_chars == 0 || self.cache.retrieval_key_chars == 0 {
            return Err(MentorError::Configuration(
                "cache key prefix lengths must be at least 1".to_string(),
            ));
        }
        if self.generation.timeout_ms == 0 {
            return Err(MentorError::Configuration(
                "generation.timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory for the local store files, falling back to the platform data dir.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.storage.data_dir {
            return Ok(dir.clone());
        }
        Ok(project_dirs()?.data_dir().to_path_buf())
    }
}

pub struct ConfigManager {
    config: MentorConfig,
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_path_internal()?;
        let config = Self::load_or_default(&config_path)?;

        Ok(Self {
            config,
            config_path,
        })
    }

    pub fn save(&self) -> Result<()> {
        let toml = toml::to_string_pretty(&self.config).map_err(|e| {
            MentorError::Configuration(format!("Failed to serialize config: {}", e))
        })?;

        fs::write(&self.config_path, toml)
            .map_err(|e| MentorError::Configuration(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    pub fn get(&self) -> &MentorConfig {
        &self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn get_config_path_internal() -> Result<PathBuf> {
        let project_dirs = project_dirs()?;
        let config_dir = project_dirs.config_dir();
        fs::create_dir_all(config_dir)?;

        Ok(config_dir.join("config.toml"))
    }

    /// Load a config file (if present) layered under `MENTOR__` environment overrides.
    pub fn load_or_default(path: &Path) -> Result<MentorConfig> {
        let mut builder = Config::builder();
        if path.exists() {
            builder = builder.add_source(File::from(path.to_path_buf()));
        }

        let s = builder
            .add_source(Environment::with_prefix("MENTOR").separator("__"))
            .build()
            .map_err(|e| MentorError::Configuration(format!("Failed to build config: {}", e)))?;

        let config: MentorConfig = s.try_deserialize().map_err(|e| {
            MentorError::Configuration(format!("Failed to deserialize config: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "mentor", "mentor").ok_or_else(|| {
        MentorError::Configuration("Could not determine config directory".to_string())
    })
}
