//! Translation service: one adapter-merged model pair per direction

use candle_core::{Device, Tensor};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::core::cache::{ensure_cached, CachedModel, HfHub, ModelHub};
use crate::core::config::TranslatorConfig;
use crate::core::errors::{Result, TranslationError};
use crate::core::generation::{
    load_t5_config, DecodingStrategy, GenerationBudget, GenerationParams, Generator, T5Generator,
};
use crate::core::lora::LoraAdapter;
use crate::core::models::{Direction, TranslationRequest};

const TOKENIZER_FILE: &str = "tokenizer.json";

/// Blocking translation backend shared by the worker pool
pub trait Translate: Send + Sync {
    /// Translate one request; blocks until generation finishes or the budget runs out
    fn translate(&self, request: &TranslationRequest, budget: &GenerationBudget) -> Result<String>;
}

/// Tokenizer plus generator replicas for one direction
pub struct ModelPair {
    tokenizer: Tokenizer,
    replicas: Vec<Mutex<Box<dyn Generator>>>,
    next: AtomicUsize,
}

impl ModelPair {
    /// Pair a tokenizer with at least one generator replica
    pub fn new(tokenizer: Tokenizer, replicas: Vec<Box<dyn Generator>>) -> Result<Self> {
        if replicas.is_empty() {
            return Err(TranslationError::model_load("a model pair needs at least one replica"));
        }

        Ok(Self {
            tokenizer,
            replicas: replicas.into_iter().map(Mutex::new).collect(),
            next: AtomicUsize::new(0),
        })
    }

    /// Take any idle replica, or wait for one in round-robin order
    fn acquire(&self) -> Result<MutexGuard<'_, Box<dyn Generator>>> {
        for replica in &self.replicas {
            match replica.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::WouldBlock) => continue,
                Err(TryLockError::Poisoned(_)) => {
                    return Err(TranslationError::InternalError(
                        "model replica poisoned by an earlier panic".to_string(),
                    ))
                }
            }
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.replicas.len();
        self.replicas[index].lock().map_err(|_| {
            TranslationError::InternalError("model replica poisoned by an earlier panic".to_string())
        })
    }

    fn run(&self, text: &str, params: &GenerationParams, budget: &GenerationBudget) -> Result<String> {
        let encoding = self.tokenizer.encode(text, true)?;
        let input_ids = encoding.get_ids();
        if input_ids.is_empty() {
            return Err(TranslationError::invalid_input("text produced no tokens"));
        }

        let output_ids = {
            let mut generator = self.acquire()?;
            budget.check()?;
            generator.generate(input_ids, params, budget)?
        };

        let text = self.tokenizer.decode(&output_ids, true)?;
        Ok(text.trim().to_string())
    }
}

/// Owns exactly one model pair for each direction
pub struct TranslationService {
    russian: ModelPair,
    nanai: ModelPair,
    max_length: usize,
    sampling_temperature: f64,
}

impl TranslationService {
    /// Download what is missing, then load the base model and both adapters
    pub fn construct(config: &TranslatorConfig) -> Result<Self> {
        config.validate()?;
        let hub = HfHub::new(config)?;
        Self::construct_with_hub(config, &hub)
    }

    /// Same as [`TranslationService::construct`] with an explicit hub
    pub fn construct_with_hub(config: &TranslatorConfig, hub: &dyn ModelHub) -> Result<Self> {
        let start = Instant::now();
        let cached = ensure_cached(config, hub)?;

        let device = config.device_preference()?.open()?;
        let dtype = config.model_dtype()?;
        info!("Loading base model {} on {:?} ({:?})", config.model_id, device, dtype);

        let t5_config = load_t5_config(cached.path("config.json")?)?;
        let base = load_base_weights(&cached)?;
        info!("Base model loaded: {} tensors", base.len());

        let load_pair = |direction: Direction| -> Result<ModelPair> {
            let adapter_dir = config.adapter_path(direction);
            info!(
                "Loading adapter '{}' for {} -> {}",
                config.adapter_name(direction),
                direction.source(),
                direction
            );

            let adapter = LoraAdapter::load(&adapter_dir)?;
            let merged = adapter.merge_into(&base)?;

            let mut replicas: Vec<Box<dyn Generator>> = Vec::with_capacity(config.workers_per_direction);
            for _ in 0..config.workers_per_direction {
                let generator = T5Generator::load(merged.clone(), &t5_config, dtype, &device)?;
                replicas.push(Box::new(generator));
            }

            let tokenizer = load_tokenizer(&adapter_dir, &cached)?;
            ModelPair::new(tokenizer, replicas)
        };

        let russian = load_pair(Direction::Russian)?;
        let nanai = load_pair(Direction::Nanai)?;

        info!("Translation service ready in {:?}", start.elapsed());

        Ok(Self::from_pairs(russian, nanai, config))
    }

    /// Assemble a service from already built pairs
    pub fn from_pairs(russian: ModelPair, nanai: ModelPair, config: &TranslatorConfig) -> Self {
        Self {
            russian,
            nanai,
            max_length: config.max_length,
            sampling_temperature: config.sampling_temperature,
        }
    }

    fn pair(&self, direction: Direction) -> &ModelPair {
        match direction {
            Direction::Russian => &self.russian,
            Direction::Nanai => &self.nanai,
        }
    }

    /// Greedy translation with no deadline, capped at `max_length` tokens
    pub fn translate_text(&self, text: &str, direction: Direction, max_length: usize) -> Result<String> {
        let request = TranslationRequest::new(text, direction).with_max_length(max_length);
        self.translate(&request, &GenerationBudget::unbounded())
    }
}

impl Translate for TranslationService {
    fn translate(&self, request: &TranslationRequest, budget: &GenerationBudget) -> Result<String> {
        request.validate()?;

        let max_length = request
            .max_length
            .map(|len| len.min(self.max_length))
            .unwrap_or(self.max_length);
        let params = GenerationParams {
            max_length,
            strategy: DecodingStrategy::for_attempt(request.attempt, self.sampling_temperature),
        };

        let start = Instant::now();
        let translation = self.pair(request.direction).run(&request.text, &params, budget)?;
        debug!(
            direction = %request.direction,
            attempt = request.attempt,
            chars_in = request.text.chars().count(),
            chars_out = translation.chars().count(),
            "Generated translation in {:?}",
            start.elapsed()
        );

        Ok(translation)
    }
}

/// Load every cached weight file into one CPU tensor map
fn load_base_weights(cached: &CachedModel) -> Result<HashMap<String, Tensor>> {
    let mut tensors = HashMap::new();
    for path in cached.weight_paths() {
        debug!("Reading weights from {}", path.display());
        tensors.extend(candle_core::safetensors::load(path, &Device::Cpu)?);
    }

    if tensors.is_empty() {
        return Err(TranslationError::model_load("base model has no weight tensors"));
    }
    Ok(tensors)
}

/// Prefer the adapter's tokenizer (it may carry extra vocabulary), else the base model's
fn load_tokenizer(adapter_dir: &Path, cached: &CachedModel) -> Result<Tokenizer> {
    let adapter_tokenizer = adapter_dir.join(TOKENIZER_FILE);
    let path = if adapter_tokenizer.exists() {
        adapter_tokenizer
    } else if let Some(base) = cached.get(TOKENIZER_FILE) {
        base.to_path_buf()
    } else {
        return Err(TranslationError::model_load(format!(
            "no {} in {} and none cached for the base model",
            TOKENIZER_FILE,
            adapter_dir.display()
        )));
    };

    Ok(Tokenizer::from_file(path)?)
}
