use std::env;
use std::path::PathBuf;

/// Runtime configuration, read once from the environment at boot.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    /// Directory for the saga store and vector store sqlite files.
    pub data_dir: PathBuf,
    /// Sqlite path override for the saga state store.
    pub state_store_url: Option<String>,
    /// Bus backend selector; unset or `mem://` picks the bundled in-process
    /// broker, anything else is refused at boot.
    pub bus_url: Option<String>,
    /// Remote registry base URL; when unset the registry runs in-process.
    pub registry_url: Option<String>,
    pub llm_api_key: String,
    pub llm_base_url: String,
    pub llm_model: String,
    pub embed_model: String,
    pub embedding_dimension: usize,
    /// Deterministic canned LLM responses for tests and local runs.
    pub mock_llm: bool,
    pub workers_per_stage: usize,
}

/// Message-bus backend selected by `BUS_URL`. External brokers plug in
/// through the `MessageBus` trait; this enum names what is bundled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusBackend {
    InProcess,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            api_host: env_or("API_HOST", "0.0.0.0"),
            api_port: env_or("API_PORT", "8000").parse().unwrap_or(8000),
            data_dir: PathBuf::from(env_or("DATA_DIR", "./data")),
            state_store_url: env::var("STATE_STORE_URL").ok(),
            bus_url: env::var("BUS_URL").ok(),
            registry_url: env::var("REGISTRY_URL").ok(),
            llm_api_key: env_or("LLM_API_KEY", ""),
            llm_base_url: env_or("LLM_BASE_URL", "https://api.openai.com/v1"),
            llm_model: env_or("LLM_MODEL", "gpt-4o-mini"),
            embed_model: env_or("EMBED_MODEL", "text-embedding-004"),
            embedding_dimension: env_or("EMBED_DIMENSION", "768").parse().unwrap_or(768),
            mock_llm: env_flag("MOCK_LLM"),
            workers_per_stage: env_or("WORKERS_PER_STAGE", "2").parse().unwrap_or(2),
        }
    }

    /// Resolve `BUS_URL` to a bus backend. Only the in-process broker
    /// ships; an unknown scheme is a boot error, not a silent fallback.
    pub fn bus_backend(&self) -> Result<BusBackend, String> {
        match self.bus_url.as_deref() {
            None => Ok(BusBackend::InProcess),
            Some(url) if url == "mem" || url.starts_with("mem://") => Ok(BusBackend::InProcess),
            Some(other) => Err(format!(
                "unsupported BUS_URL '{other}': only the bundled mem:// broker is available"
            )),
        }
    }

    pub fn saga_store_path(&self) -> PathBuf {
        match &self.state_store_url {
            Some(url) => PathBuf::from(url),
            None => self.data_dir.join("sagas.db"),
        }
    }

    pub fn vector_store_path(&self) -> PathBuf {
        self.data_dir.join("knowledge.db")
    }
}
