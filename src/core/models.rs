//! Core data models for translation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

use crate::core::errors::{Result, TranslationError};

/// Target language of a translation.
///
/// Each direction is served by its own LoRA adapter on top of the shared base model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Nanai → Russian
    Russian,
    /// Russian → Nanai
    Nanai,
}

impl Direction {
    /// Both directions, in load order
    pub const ALL: [Direction; 2] = [Direction::Russian, Direction::Nanai];

    /// Wire name of the direction
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Russian => "russian",
            Direction::Nanai => "nanai",
        }
    }

    /// Language the input text is expected to be in
    pub fn source(&self) -> Direction {
        match self {
            Direction::Russian => Direction::Nanai,
            Direction::Nanai => Direction::Russian,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Direction {
    type Err = TranslationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "russian" | "ru" => Ok(Direction::Russian),
            "nanai" | "gld" => Ok(Direction::Nanai),
            other => Err(TranslationError::invalid_input(format!(
                "unknown direction '{}', expected 'russian' or 'nanai'",
                other
            ))),
        }
    }
}

/// Translation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationRequest {
    /// Source text
    pub text: String,
    /// Target language
    pub direction: Direction,
    /// Token cap for this request; the service clamps it to its configured maximum
    pub max_length: Option<usize>,
    /// 1 for the primary translation, >1 for reproducible alternatives
    pub attempt: u32,
}

impl TranslationRequest {
    /// Canonical (attempt 1) request with the service's default length cap
    pub fn new(text: impl Into<String>, direction: Direction) -> Self {
        Self {
            text: text.into(),
            direction,
            max_length: None,
            attempt: 1,
        }
    }

    /// Set the token cap
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    /// Set the alternative number; values below 1 become 1
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }

    /// Reject input that must never reach a model
    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(TranslationError::invalid_input(
                "text to translate must not be empty",
            ));
        }
        if self.max_length == Some(0) {
            return Err(TranslationError::invalid_input(
                "max_length must be greater than 0",
            ));
        }
        Ok(())
    }
}
