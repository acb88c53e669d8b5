//! PEFT LoRA adapters merged into base model weights
//!
//! An adapter directory holds `adapter_config.json` and `adapter_model.safetensors`.
//! Every `lora_A`/`lora_B` pair becomes a dense delta `scaling * B·A` added onto the
//! targeted base weight, and any other tensor in the adapter (`modules_to_save`,
//! resized embeddings) replaces the base tensor of the same name. The merged map can
//! be handed straight to a `VarBuilder`, so inference runs on plain dense weights.

use candle_core::{DType, Device, Tensor};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info};

use crate::core::errors::{Result, TranslationError};

const ADAPTER_CONFIG: &str = "adapter_config.json";
const ADAPTER_WEIGHTS: &str = "adapter_model.safetensors";
const PEFT_PREFIX: &str = "base_model.model.";

/// Subset of `adapter_config.json` needed to merge
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    #[serde(default)]
    pub peft_type: Option<String>,
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub fan_in_fan_out: bool,
    #[serde(default)]
    pub use_rslora: bool,
    #[serde(default)]
    pub rank_pattern: Option<HashMap<String, usize>>,
    #[serde(default)]
    pub alpha_pattern: Option<HashMap<String, f64>>,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
}

impl AdapterConfig {
    /// Scaling factor applied to `B·A` for one module
    fn scaling(&self, module: &str, rank: usize) -> f64 {
        let rank = pattern_lookup(self.rank_pattern.as_ref(), module).unwrap_or(rank);
        let alpha = pattern_lookup(self.alpha_pattern.as_ref(), module).unwrap_or(self.lora_alpha);

        if self.use_rslora {
            alpha / (rank as f64).sqrt()
        } else {
            alpha / rank as f64
        }
    }
}

/// PEFT pattern keys match a module whose dotted name ends with the key
fn pattern_lookup<T: Copy>(patterns: Option<&HashMap<String, T>>, module: &str) -> Option<T> {
    patterns?
        .iter()
        .find(|(key, _)| module == key.as_str() || module.ends_with(&format!(".{}", key)))
        .map(|(_, value)| *value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoraKind {
    Linear,
    Embedding,
}

#[derive(Debug, Default)]
struct PartialPair {
    a: Option<Tensor>,
    b: Option<Tensor>,
    kind: Option<LoraKind>,
}

#[derive(Debug, Clone)]
struct LoraPair {
    a: Tensor,
    b: Tensor,
    kind: LoraKind,
}

/// A loaded LoRA adapter ready to be merged
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    pub name: String,
    pub config: AdapterConfig,
    pairs: BTreeMap<String, LoraPair>,
    replacements: HashMap<String, Tensor>,
}

impl LoraAdapter {
    /// Load an adapter directory saved by PEFT
    pub fn load(dir: &Path) -> Result<Self> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| dir.display().to_string());

        let config_path = dir.join(ADAPTER_CONFIG);
        if !config_path.exists() {
            return Err(TranslationError::model_load(format!(
                "adapter '{}' has no {}",
                name, ADAPTER_CONFIG
            )));
        }
        let config: AdapterConfig = serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;

        let weights_path = dir.join(ADAPTER_WEIGHTS);
        if !weights_path.exists() {
            return Err(TranslationError::model_load(format!(
                "adapter '{}' has no {} (pickled adapters must be converted to safetensors)",
                name, ADAPTER_WEIGHTS
            )));
        }
        let tensors = candle_core::safetensors::load(&weights_path, &Device::Cpu)?;

        Self::from_parts(name, config, tensors)
    }

    /// Build an adapter from its config and raw PEFT state dict
    pub fn from_parts(
        name: impl Into<String>,
        config: AdapterConfig,
        tensors: HashMap<String, Tensor>,
    ) -> Result<Self> {
        let name = name.into();

        if let Some(peft_type) = &config.peft_type {
            if !peft_type.eq_ignore_ascii_case("lora") {
                return Err(TranslationError::model_load(format!(
                    "adapter '{}' is {}, only LORA adapters can be merged",
                    name, peft_type
                )));
            }
        }

        let mut partial: BTreeMap<String, PartialPair> = BTreeMap::new();
        let mut replacements = HashMap::new();

        for (key, tensor) in tensors {
            let key = key.strip_prefix(PEFT_PREFIX).unwrap_or(&key).to_string();

            if key.contains(".lora_magnitude_vector") {
                return Err(TranslationError::model_load(format!(
                    "adapter '{}' uses DoRA, which cannot be merged",
                    name
                )));
            }

            if let Some((module, kind, is_a)) = split_lora_key(&key) {
                let entry = partial.entry(module).or_default();
                entry.kind = Some(kind);
                if is_a {
                    entry.a = Some(tensor);
                } else {
                    entry.b = Some(tensor);
                }
                continue;
            }

            if key.contains(".original_module.") {
                continue;
            }

            let target = key
                .replace(".modules_to_save.default", "")
                .replace(".modules_to_save", "");
            replacements.insert(target, tensor);
        }

        let mut pairs = BTreeMap::new();
        for (module, pair) in partial {
            match (pair.a, pair.b, pair.kind) {
                (Some(a), Some(b), Some(kind)) => {
                    pairs.insert(module, LoraPair { a, b, kind });
                }
                _ => {
                    return Err(TranslationError::model_load(format!(
                        "adapter '{}' has an incomplete LoRA pair for {}",
                        name, module
                    )))
                }
            }
        }

        debug!(
            "Adapter '{}': {} LoRA pairs, {} full tensors",
            name,
            pairs.len(),
            replacements.len()
        );

        Ok(Self {
            name,
            config,
            pairs,
            replacements,
        })
    }

    /// Number of low-rank pairs in the adapter
    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    /// Names of the base tensors the adapter replaces outright
    pub fn replaced_tensors(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.replacements.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Produce a new weight map with the adapter folded in; `base` is left untouched
    pub fn merge_into(&self, base: &HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
        let mut merged = base.clone();

        for (name, tensor) in &self.replacements {
            merged.insert(name.clone(), tensor.clone());
        }

        for (module, pair) in &self.pairs {
            let weight_key = format!("{}.weight", module);
            let weight = merged.get(&weight_key).ok_or_else(|| {
                TranslationError::model_load(format!(
                    "adapter '{}' targets {}, which the base model does not have",
                    self.name, weight_key
                ))
            })?;

            let rank = pair.a.dim(0)?;
            let scaling = self.config.scaling(module, rank);

            let a = pair.a.to_dtype(DType::F32)?;
            let b = pair.b.to_dtype(DType::F32)?;
            let mut delta = b.matmul(&a)?;
            if pair.kind == LoraKind::Embedding || self.config.fan_in_fan_out {
                delta = delta.t()?.contiguous()?;
            }
            let delta = delta.affine(scaling, 0.0)?;

            if delta.dims() != weight.dims() {
                return Err(TranslationError::model_load(format!(
                    "adapter '{}' delta for {} has shape {:?}, base weight is {:?}",
                    self.name,
                    weight_key,
                    delta.dims(),
                    weight.dims()
                )));
            }

            let dtype = weight.dtype();
            let updated = weight
                .to_device(&Device::Cpu)?
                .to_dtype(DType::F32)?
                .add(&delta)?
                .to_dtype(dtype)?;
            merged.insert(weight_key, updated);
        }

        info!(
            "Merged adapter '{}' ({} modules, scaling base alpha {} / r {})",
            self.name,
            self.pairs.len(),
            self.config.lora_alpha,
            self.config.r
        );

        Ok(merged)
    }
}

/// Split `module.lora_A.weight`-style keys into (module, kind, is_a)
fn split_lora_key(key: &str) -> Option<(String, LoraKind, bool)> {
    const MARKERS: [(&str, LoraKind, bool); 4] = [
        (".lora_embedding_A", LoraKind::Embedding, true),
        (".lora_embedding_B", LoraKind::Embedding, false),
        (".lora_A", LoraKind::Linear, true),
        (".lora_B", LoraKind::Linear, false),
    ];

    MARKERS.iter().find_map(|(marker, kind, is_a)| {
        key.find(marker)
            .map(|idx| (key[..idx].to_string(), *kind, *is_a))
    })
}
