use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::Dataset;
use crate::error::IngestError;

pub const DEFAULT_CONFIG_FILE: &str = "bts-ingest.json";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub dataset: Dataset,
    pub geography: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub max_attempts: u32,
    pub patient_mode: bool,
    pub patient_read_timeout_secs: u64,
    pub stream_chunk_size: usize,
    pub stall_secs: u64,
    pub unit_deadline_secs: u64,
    pub max_units_per_invocation: usize,
    pub keep_local: bool,
    pub backoff_cap_secs: u64,
    pub courtesy_delay_ms: [u64; 2],
    pub claim_ttl_secs: u64,
    pub work_dir: PathBuf,
    pub container: Option<String>,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Containers are subdirectories of `root`.
    Fs { root: PathBuf },
    /// Blob REST endpoint addressed through a SAS URL of the storage account.
    Azure { sas_url: String },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Fs {
            root: PathBuf::from("blob"),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dataset: Dataset::default(),
            geography: "All".to_string(),
            connect_timeout_secs: 15,
            read_timeout_secs: 180,
            max_attempts: 5,
            patient_mode: true,
            patient_read_timeout_secs: 420,
            stream_chunk_size: 64 * 1024,
            stall_secs: 45,
            unit_deadline_secs: 900,
            max_units_per_invocation: 1,
            keep_local: false,
            backoff_cap_secs: 60,
            courtesy_delay_ms: [250, 900],
            claim_ttl_secs: 1800,
            work_dir: PathBuf::from("out"),
            container: None,
            store: StoreConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn container(&self) -> &str {
        self.container
            .as_deref()
            .unwrap_or_else(|| self.dataset.default_container())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn patient_read_timeout(&self) -> Duration {
        Duration::from_secs(self.patient_read_timeout_secs)
    }

    pub fn stall_window(&self) -> Duration {
        Duration::from_secs(self.stall_secs)
    }

    pub fn unit_deadline(&self) -> Duration {
        Duration::from_secs(self.unit_deadline_secs)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }

    pub fn courtesy_delay(&self) -> (Duration, Duration) {
        let [lo, hi] = self.courtesy_delay_ms;
        (Duration::from_millis(lo), Duration::from_millis(hi))
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.max_attempts == 0 {
            return Err(IngestError::ConfigValue(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.stream_chunk_size == 0 {
            return Err(IngestError::ConfigValue(
                "stream_chunk_size must be positive".to_string(),
            ));
        }
        if self.max_units_per_invocation == 0 {
            return Err(IngestError::ConfigValue(
                "max_units_per_invocation must be at least 1".to_string(),
            ));
        }
        let [lo, hi] = self.courtesy_delay_ms;
        if lo > hi {
            return Err(IngestError::ConfigValue(format!(
                "courtesy_delay_ms lower bound {lo} exceeds upper bound {hi}"
            )));
        }
        Ok(())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads the JSON file (explicit path or `bts-ingest.json`), then applies
    /// environment overrides. A missing default file means built-in defaults.
    pub fn resolve(path: Option<&str>) -> Result<PipelineConfig, IngestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.exists() {
            PipelineConfig::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| IngestError::ConfigRead(config_path.clone()))?;
            Self::parse(&content)?
        };

        Self::resolve_config(config, |key| std::env::var(key).ok())
    }

    pub fn parse(content: &str) -> Result<PipelineConfig, IngestError> {
        serde_json::from_str(content).map_err(|err| IngestError::ConfigParse(err.to_string()))
    }

    /// Applies overrides from `lookup` (normally the process environment).
    pub fn resolve_config<F>(
        mut config: PipelineConfig,
        lookup: F,
    ) -> Result<PipelineConfig, IngestError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = get("BTS_DATASET") {
            config.dataset = value.parse()?;
        }
        if let Some(value) = get("BTS_GEO") {
            config.geography = value;
        }
        if let Some(value) = get("BTS_CONTAINER") {
            config.container = Some(value);
        }
        if let Some(value) = get("BASE_OUT") {
            config.work_dir = PathBuf::from(value);
        }
        override_num(&get, "BTS_CONNECT_TIMEOUT", &mut config.connect_timeout_secs)?;
        override_num(&get, "BTS_READ_TIMEOUT", &mut config.read_timeout_secs)?;
        override_num(&get, "BTS_MAX_RETRIES", &mut config.max_attempts)?;
        override_num(
            &get,
            "BTS_READ_TIMEOUT_PATIENT",
            &mut config.patient_read_timeout_secs,
        )?;
        override_num(&get, "BTS_STREAM_CHUNK_SIZE", &mut config.stream_chunk_size)?;
        override_num(&get, "BTS_CHUNK_STALL_SECONDS", &mut config.stall_secs)?;
        override_num(
            &get,
            "BTS_PER_QUARTER_DEADLINE_S",
            &mut config.unit_deadline_secs,
        )?;
        override_num(
            &get,
            "BTS_MAX_Q_PER_INVOC",
            &mut config.max_units_per_invocation,
        )?;
        override_num(&get, "BTS_CLAIM_TTL_S", &mut config.claim_ttl_secs)?;
        if let Some(value) = get("BTS_PATIENT_MODE") {
            config.patient_mode = parse_flag(&value);
        }
        if let Some(value) = get("BTS_KEEP_LOCAL") {
            config.keep_local = parse_flag(&value);
        }
        if let Some(value) = get("AZURE_STORAGE_SAS_URL") {
            config.store = StoreConfig::Azure { sas_url: value };
        }

        config.validate()?;
        Ok(config)
    }
}

fn override_num<G, T>(get: &G, key: &str, target: &mut T) -> Result<(), IngestError>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(value) = get(key) {
        *target = value
            .parse()
            .map_err(|_| IngestError::ConfigValue(format!("{key}={value}")))?;
    }
    Ok(())
}

/// `0`, `false` and `no` switch a flag off; anything else switches it on.
fn parse_flag(value: &str) -> bool {
    !matches!(value.to_ascii_lowercase().as_str(), "0" | "false" | "no")
}
