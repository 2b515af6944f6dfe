//! Configuration: service settings and the per-tenant persona.
//!
//! Settings load from a TOML file (created with defaults on first use) and
//! can be overridden per-knob from the environment, so deployments keep
//! secrets out of the file.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::errors::{RagError, Result};

/// Service settings. Defaults match the documented knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Chunking
    pub chunk_size: usize,
    pub chunk_overlap: usize,

    // Retrieval
    pub retrieval_top_k: usize,
    pub rerank_top_k: usize,
    pub final_top_k: usize,
    pub max_retries: usize,
    pub enable_query_expansion: bool,

    // Conversation memory
    pub memory_window: usize,
    pub summary_max_tokens: u32,

    // Models
    pub embed_model: String,
    pub embed_dim: usize,
    pub embed_max_batch: usize,
    pub embed_max_item_tokens: usize,
    pub chat_model: String,

    // LLM provider
    pub llm_base_url: String,
    pub llm_api_key: String,

    // Vector store
    pub qdrant_url: String,
    pub qdrant_collection: String,

    // Storage paths
    pub upload_dir: PathBuf,
    pub chunks_dir: PathBuf,

    // Chat turn limits
    pub turn_deadline_secs: u64,
    pub persist_grace_secs: u64,

    // Ingestion
    pub queue_capacity: usize,
    pub worker_count: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 50,
            retrieval_top_k: 20,
            rerank_top_k: 10,
            final_top_k: 5,
            max_retries: 1,
            enable_query_expansion: true,
            memory_window: 10,
            summary_max_tokens: 500,
            embed_model: "text-embedding-3-small".to_string(),
            embed_dim: 1536,
            embed_max_batch: 128,
            embed_max_item_tokens: 8192,
            chat_model: "gpt-4o-mini".to_string(),
            llm_base_url: "https://api.openai.com/v1".to_string(),
            llm_api_key: String::new(),
            qdrant_url: "http://localhost:6334".to_string(),
            qdrant_collection: "chunks".to_string(),
            upload_dir: PathBuf::from("./data/uploads"),
            chunks_dir: PathBuf::from("./data/chunks"),
            turn_deadline_secs: 60,
            persist_grace_secs: 5,
            queue_capacity: 64,
            worker_count: 4,
        }
    }
}

impl Settings {
    /// Load settings from `path`, creating the file with defaults if it
    /// does not exist yet.
    pub fn load_or_default(path: &PathBuf) -> anyhow::Result<Self> {
        if !path.exists() {
            let settings = Settings::default();
            settings.save(path)?;
            return Ok(settings);
        }

        let contents = fs::read_to_string(path).context("Failed to read settings file")?;
        let settings: Settings =
            toml::from_str(&contents).context("Failed to parse settings file")?;
        Ok(settings)
    }

    /// Save settings to `path`, creating parent directories as needed.
    pub fn save(&self, path: &PathBuf) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create settings directory")?;
        }
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize settings")?;
        fs::write(path, toml_string).context("Failed to write settings file")?;
        Ok(())
    }

    /// Default settings file location.
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".ragmill").join("settings.toml"))
    }

    /// Apply environment overrides on top of the loaded values. Unset or
    /// unparseable variables leave the current value untouched.
    pub fn apply_env(&mut self) {
        fn read<T: std::str::FromStr>(key: &str, slot: &mut T) {
            if let Ok(raw) = env::var(key) {
                if let Ok(value) = raw.parse::<T>() {
                    *slot = value;
                }
            }
        }

        read("CHUNK_SIZE", &mut self.chunk_size);
        read("CHUNK_OVERLAP", &mut self.chunk_overlap);
        read("RETRIEVAL_TOP_K", &mut self.retrieval_top_k);
        read("RERANK_TOP_K", &mut self.rerank_top_k);
        read("FINAL_TOP_K", &mut self.final_top_k);
        read("MAX_RETRIES", &mut self.max_retries);
        read("ENABLE_QUERY_EXPANSION", &mut self.enable_query_expansion);
        read("MEMORY_WINDOW", &mut self.memory_window);
        read("EMBEDDING_MODEL", &mut self.embed_model);
        read("LLM_MODEL", &mut self.chat_model);
        read("LLM_BASE_URL", &mut self.llm_base_url);
        read("LLM_API_KEY", &mut self.llm_api_key);
        read("QDRANT_URL", &mut self.qdrant_url);
        if let Ok(dir) = env::var("UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = env::var("CHUNKS_DIR") {
            self.chunks_dir = PathBuf::from(dir);
        }
    }

    /// Validate invariants between knobs.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_overlap >= self.chunk_size {
            return Err(RagError::Config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.final_top_k > self.rerank_top_k || self.rerank_top_k > self.retrieval_top_k {
            return Err(RagError::Config(
                "expected final_top_k <= rerank_top_k <= retrieval_top_k".to_string(),
            ));
        }
        Ok(())
    }
}

/// Industry categories for the tenant persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Industry {
    Ecommerce,
    Finance,
    Healthcare,
    RealEstate,
    Insurance,
    Education,
    Technology,
    Retail,
    Other,
}

/// Brand tone for the tenant persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrandTone {
    Professional,
    Friendly,
    Casual,
    Formal,
    Technical,
    Empathetic,
}

impl BrandTone {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrandTone::Professional => "professional",
            BrandTone::Friendly => "friendly",
            BrandTone::Casual => "casual",
            BrandTone::Formal => "formal",
            BrandTone::Technical => "technical",
            BrandTone::Empathetic => "empathetic",
        }
    }
}

/// Immutable per-request tenant persona consumed by the generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantPersona {
    pub brand_name: String,
    pub industry: Industry,
    pub brand_tone: BrandTone,
    /// Languages the assistant may answer in.
    pub languages: Vec<String>,
    /// Declared capabilities, rendered into the system preamble.
    pub capabilities: Vec<String>,
    /// Prohibitions and constraints the assistant must honour.
    pub constraints: Vec<String>,
    /// Tenant sites, for persona context only.
    pub base_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_instructions: Option<String>,
}

impl TenantPersona {
    /// Neutral persona used when a tenant has not configured one.
    pub fn neutral(brand_name: impl Into<String>) -> Self {
        Self {
            brand_name: brand_name.into(),
            industry: Industry::Other,
            brand_tone: BrandTone::Professional,
            languages: vec!["en".to_string()],
            capabilities: Vec::new(),
            constraints: Vec::new(),
            base_urls: Vec::new(),
            custom_instructions: None,
        }
    }
}
