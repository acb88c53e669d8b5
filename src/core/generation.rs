//! Seq2seq generation on candle's T5 / mT5 implementation

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::t5;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::core::errors::{Result, TranslationError};

/// How the next token is chosen at each decoding step
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodingStrategy {
    /// Always take the most likely token
    Greedy,
    /// Sample with a fixed seed, so the same seed yields the same output
    Sampling { seed: u64, temperature: f64 },
}

impl DecodingStrategy {
    /// Attempt 1 is the canonical translation; later attempts are seeded alternatives
    pub fn for_attempt(attempt: u32, temperature: f64) -> Self {
        if attempt <= 1 {
            DecodingStrategy::Greedy
        } else {
            DecodingStrategy::Sampling {
                seed: attempt as u64,
                temperature,
            }
        }
    }

    fn logits_processor(&self) -> LogitsProcessor {
        match *self {
            DecodingStrategy::Greedy => LogitsProcessor::new(0, None, None),
            DecodingStrategy::Sampling { seed, temperature } => {
                LogitsProcessor::new(seed, Some(temperature), None)
            }
        }
    }
}

/// Per-call generation settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    /// Upper bound on generated tokens
    pub max_length: usize,
    /// Token selection rule
    pub strategy: DecodingStrategy,
}

/// Deadline and cancellation flag checked between decoding steps
#[derive(Debug, Clone, Default)]
pub struct GenerationBudget {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl GenerationBudget {
    /// No deadline, never cancelled unless asked to
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Budget that expires `timeout` from now
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Ask the running generation to stop at its next step
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether [`GenerationBudget::cancel`] was called
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Guard that cancels this budget when dropped
    pub fn cancel_on_drop(&self) -> CancelOnDrop {
        CancelOnDrop {
            budget: self.clone(),
        }
    }

    /// Fail if the caller gave up or the deadline passed
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(TranslationError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(TranslationError::TimeoutError);
            }
        }
        Ok(())
    }
}

/// Cancels the owning budget on drop
#[derive(Debug)]
pub struct CancelOnDrop {
    budget: GenerationBudget,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.budget.cancel();
    }
}

/// One model replica able to turn source token ids into target token ids.
///
/// Implementations keep mutable decoding state, so callers hold exclusive access
/// for the duration of a call.
pub trait Generator: Send {
    /// Generate target ids for `input_ids`, without the decoder start token
    fn generate(
        &mut self,
        input_ids: &[u32],
        params: &GenerationParams,
        budget: &GenerationBudget,
    ) -> Result<Vec<u32>>;
}

/// Architecture tag from a model's `config.json`
#[derive(Debug, Deserialize)]
struct ModelType {
    #[serde(default)]
    model_type: Option<String>,
}

/// Read a T5 / mT5 `config.json`, rejecting other architectures
pub fn load_t5_config(path: &Path) -> Result<t5::Config> {
    let raw = std::fs::read_to_string(path)?;

    let ModelType { model_type } = serde_json::from_str(&raw)?;
    match model_type.as_deref() {
        Some("t5") | Some("mt5") | None => {}
        Some(other) => {
            return Err(TranslationError::model_load(format!(
                "unsupported base architecture '{}', expected t5 or mt5",
                other
            )))
        }
    }

    let mut config: t5::Config = serde_json::from_str(&raw)?;
    config.use_cache = true;
    Ok(config)
}

/// T5 encoder-decoder with merged weights
pub struct T5Generator {
    model: t5::T5ForConditionalGeneration,
    config: t5::Config,
    device: Device,
}

impl T5Generator {
    /// Build a replica from a (merged) weight map
    pub fn load(
        weights: HashMap<String, Tensor>,
        config: &t5::Config,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let mut config = config.clone();
        if let Some(shared) = weights.get("shared.weight") {
            let vocab = shared.dim(0)?;
            if vocab != config.vocab_size {
                debug!("Vocabulary resized by adapter: {} -> {}", config.vocab_size, vocab);
                config.vocab_size = vocab;
            }
        }

        let vb = VarBuilder::from_tensors(weights, dtype, device);
        let model = t5::T5ForConditionalGeneration::load(vb, &config)?;

        Ok(Self {
            model,
            config,
            device: device.clone(),
        })
    }

    fn decoder_start_token(&self) -> u32 {
        self.config
            .decoder_start_token_id
            .unwrap_or(self.config.pad_token_id) as u32
    }

    fn run(
        &mut self,
        input_ids: &[u32],
        params: &GenerationParams,
        budget: &GenerationBudget,
    ) -> Result<Vec<u32>> {
        let input = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;
        let encoder_output = self.model.encode(&input)?;

        let eos = self.config.eos_token_id as u32;
        let mut logits_processor = params.strategy.logits_processor();
        let mut output_ids = vec![self.decoder_start_token()];

        for step in 0..params.max_length {
            budget.check()?;

            let decoder_input = if step == 0 || !self.config.use_cache {
                Tensor::new(output_ids.as_slice(), &self.device)?.unsqueeze(0)?
            } else {
                let last = output_ids[output_ids.len() - 1];
                Tensor::new(&[last], &self.device)?.unsqueeze(0)?
            };

            let logits = self
                .model
                .decode(&decoder_input, &encoder_output)?
                .squeeze(0)?
                .to_dtype(DType::F32)?;
            let next = logits_processor.sample(&logits)?;

            if next == eos {
                break;
            }
            output_ids.push(next);
        }

        Ok(output_ids.split_off(1))
    }
}

impl Generator for T5Generator {
    fn generate(
        &mut self,
        input_ids: &[u32],
        params: &GenerationParams,
        budget: &GenerationBudget,
    ) -> Result<Vec<u32>> {
        self.model.clear_kv_cache();
        let result = self.run(input_ids, params, budget);
        self.model.clear_kv_cache();
        result
    }
}
