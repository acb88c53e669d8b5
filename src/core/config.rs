//! Configuration management

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::core::errors::{Result, TranslationError};
use crate::core::models::Direction;

/// Configuration for translator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslatorConfig {
    /// Hub id of the base model
    pub model_id: String,
    /// Hub access token, never serialized
    #[serde(default, skip_serializing)]
    pub hugging_face_token: Option<String>,
    /// Hub cache directory
    pub cache_dir: PathBuf,
    /// Directory holding one subdirectory per adapter
    pub lora_dir: PathBuf,
    /// Files the base model checkout must provide
    pub filenames: Vec<String>,
    /// Adapter producing Russian
    pub russian_adapter: String,
    /// Adapter producing Nanai
    pub nanai_adapter: String,
    /// Upper bound on generated tokens
    pub max_length: usize,
    /// Model replicas, and so concurrent generations, per direction
    pub workers_per_direction: usize,
    /// Per-request generation budget; 0 disables it
    pub generation_timeout_ms: u64,
    /// Extra download attempts after the first failure
    pub download_max_retries: u32,
    /// Backoff base between download attempts
    pub download_retry_delay_ms: u64,
    /// Never contact the hub
    pub offline: bool,
    /// `auto`, `cpu`, `cuda[:N]` or `metal[:N]`
    pub device: String,
    /// `f32`, `f16` or `bf16`
    pub dtype: String,
    /// Temperature for alternative translations
    pub sampling_temperature: f64,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            model_id: String::new(),
            hugging_face_token: None,
            cache_dir: PathBuf::from("models/cache"),
            lora_dir: PathBuf::from("models/lora"),
            filenames: DEFAULT_FILENAMES.iter().map(|f| f.to_string()).collect(),
            russian_adapter: "nanai_lora".to_string(),
            nanai_adapter: "nanai_lora_reverse".to_string(),
            max_length: 1000,
            workers_per_direction: 1,
            generation_timeout_ms: 60_000,
            download_max_retries: 3,
            download_retry_delay_ms: 1000,
            offline: false,
            device: "auto".to_string(),
            dtype: "f32".to_string(),
            sampling_temperature: 0.7,
        }
    }
}

/// Files every base model checkout must provide
const DEFAULT_FILENAMES: &[&str] = &["config.json", "model.safetensors"];

/// Compute device requested by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    /// First CUDA device when compiled in and present, CPU otherwise
    Auto,
    /// Always the CPU
    Cpu,
    /// CUDA device with the given ordinal
    Cuda(usize),
    /// Metal device with the given ordinal
    Metal(usize),
}

impl FromStr for DevicePreference {
    type Err = TranslationError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match s.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal.parse::<usize>().map_err(|_| {
                    TranslationError::config(format!("invalid device ordinal in '{}'", s))
                })?;
                (kind.to_string(), ordinal)
            }
            None => (s.clone(), 0),
        };

        match kind.as_str() {
            "auto" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda(ordinal)),
            "metal" => Ok(DevicePreference::Metal(ordinal)),
            _ => Err(TranslationError::config(format!("unknown device '{}'", s))),
        }
    }
}

impl DevicePreference {
    /// Open the requested device
    pub fn open(&self) -> Result<Device> {
        let device = match self {
            DevicePreference::Auto => Device::cuda_if_available(0)?,
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda(ordinal) => Device::new_cuda(*ordinal)?,
            DevicePreference::Metal(ordinal) => Device::new_metal(*ordinal)?,
        };
        Ok(device)
    }
}

fn parse_dtype(s: &str) -> Result<DType> {
    match s.trim().to_ascii_lowercase().as_str() {
        "f32" | "float32" => Ok(DType::F32),
        "f16" | "float16" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        other => Err(TranslationError::config(format!("unsupported dtype '{}'", other))),
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl TranslatorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from any key/value source shaped like the process environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let model_id = get("MODEL_ID")
            .ok_or_else(|| TranslationError::config("MODEL_ID environment variable is required"))?;

        let hugging_face_token = get("HUGGING_FACE_TOKEN").or_else(|| get("HF_TOKEN"));

        let filenames = match get("MODEL_FILENAMES") {
            Some(list) => list
                .split(',')
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect(),
            None => defaults.filenames.clone(),
        };

        fn parsed<T: FromStr>(value: Option<String>, key: &str, default: T) -> Result<T> {
            match value {
                Some(raw) => raw.trim().parse::<T>().map_err(|_| {
                    TranslationError::config(format!("{} has an invalid value: '{}'", key, raw))
                }),
                None => Ok(default),
            }
        }

        let config = Self {
            model_id,
            hugging_face_token,
            cache_dir: get("CACHE_DIR").map(PathBuf::from).unwrap_or(defaults.cache_dir),
            lora_dir: get("LORA_DIR").map(PathBuf::from).unwrap_or(defaults.lora_dir),
            filenames,
            russian_adapter: get("RUSSIAN_ADAPTER").unwrap_or(defaults.russian_adapter),
            nanai_adapter: get("NANAI_ADAPTER").unwrap_or(defaults.nanai_adapter),
            max_length: parsed(get("MAX_LENGTH"), "MAX_LENGTH", defaults.max_length)?,
            workers_per_direction: parsed(
                get("WORKERS_PER_DIRECTION"),
                "WORKERS_PER_DIRECTION",
                defaults.workers_per_direction,
            )?,
            generation_timeout_ms: parsed(
                get("GENERATION_TIMEOUT_MS"),
                "GENERATION_TIMEOUT_MS",
                defaults.generation_timeout_ms,
            )?,
            download_max_retries: parsed(
                get("DOWNLOAD_MAX_RETRIES"),
                "DOWNLOAD_MAX_RETRIES",
                defaults.download_max_retries,
            )?,
            download_retry_delay_ms: parsed(
                get("DOWNLOAD_RETRY_DELAY_MS"),
                "DOWNLOAD_RETRY_DELAY_MS",
                defaults.download_retry_delay_ms,
            )?,
            offline: get("HF_HUB_OFFLINE").map(|v| parse_flag(&v)).unwrap_or(false),
            device: get("DEVICE").unwrap_or(defaults.device),
            dtype: get("MODEL_DTYPE").unwrap_or(defaults.dtype),
            sampling_temperature: parsed(
                get("SAMPLING_TEMPERATURE"),
                "SAMPLING_TEMPERATURE",
                defaults.sampling_temperature,
            )?,
        };

        info!(
            model_id = %config.model_id,
            cache_dir = %config.cache_dir.display(),
            lora_dir = %config.lora_dir.display(),
            "Loaded configuration from environment"
        );

        Ok(config)
    }

    /// Load from JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.model_id.trim().is_empty() {
            return Err(TranslationError::config("model id is required"));
        }

        if self.filenames.is_empty() {
            return Err(TranslationError::config("at least one model filename is required"));
        }

        if !self.filenames.iter().any(|f| f == "config.json") {
            return Err(TranslationError::config(
                "model filenames must include config.json",
            ));
        }

        if self.weight_files().is_empty() {
            return Err(TranslationError::config(
                "model filenames must include at least one .safetensors file",
            ));
        }

        if self.max_length == 0 {
            return Err(TranslationError::config("max_length must be greater than 0"));
        }

        if self.workers_per_direction == 0 {
            return Err(TranslationError::config(
                "workers_per_direction must be greater than 0",
            ));
        }

        if self.sampling_temperature <= 0.0 {
            return Err(TranslationError::config(
                "sampling_temperature must be greater than 0",
            ));
        }

        if self.russian_adapter == self.nanai_adapter {
            warn!("Both directions use adapter '{}'", self.russian_adapter);
        }

        self.device_preference()?;
        self.model_dtype()?;

        Ok(())
    }

    /// Adapter directory name for a direction
    pub fn adapter_name(&self, direction: Direction) -> &str {
        match direction {
            Direction::Russian => &self.russian_adapter,
            Direction::Nanai => &self.nanai_adapter,
        }
    }

    /// Full path of the adapter serving a direction
    pub fn adapter_path(&self, direction: Direction) -> PathBuf {
        self.lora_dir.join(self.adapter_name(direction))
    }

    /// Required files that carry model weights
    pub fn weight_files(&self) -> Vec<&str> {
        self.filenames
            .iter()
            .filter(|f| f.ends_with(".safetensors"))
            .map(|f| f.as_str())
            .collect()
    }

    /// Per-request generation budget, `None` when disabled
    pub fn generation_timeout(&self) -> Option<Duration> {
        (self.generation_timeout_ms > 0).then(|| Duration::from_millis(self.generation_timeout_ms))
    }

    pub fn device_preference(&self) -> Result<DevicePreference> {
        self.device.parse()
    }

    pub fn model_dtype(&self) -> Result<DType> {
        parse_dtype(&self.dtype)
    }
}
