//! Nanai Translator - Russian ↔ Nanai machine translation
//!
//! A T5 base model with one LoRA adapter per direction, merged at load time and
//! served over HTTP from a bounded pool of blocking inference workers.

#![forbid(unsafe_code)]

pub mod cli;
pub mod core;
pub mod server;

// Re-export key types for convenience
pub use core::{
    client::AsyncTranslator,
    config::TranslatorConfig,
    errors::TranslationError,
    models::{Direction, TranslationRequest},
    service::{Translate, TranslationService},
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
