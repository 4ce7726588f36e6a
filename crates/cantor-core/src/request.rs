//! Generation request parameters and their validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::catalog::{self, DEFAULT_MODEL_ID};
use crate::runtime::types::RuntimeError;

/// Supported clip lengths.
///
/// Serialized as the plain number of seconds (`95` or `285`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum AudioLength {
    /// 1m35s.
    #[default]
    Short,
    /// 4m45s.
    Full,
}

impl AudioLength {
    pub const fn seconds(self) -> u32 {
        match self {
            AudioLength::Short => 95,
            AudioLength::Full => 285,
        }
    }
}

impl TryFrom<u32> for AudioLength {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            95 => Ok(AudioLength::Short),
            285 => Ok(AudioLength::Full),
            other => Err(format!(
                "audio length must be 95 or 285 seconds (got {other})"
            )),
        }
    }
}

impl From<AudioLength> for u32 {
    fn from(value: AudioLength) -> Self {
        value.seconds()
    }
}

impl fmt::Display for AudioLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.seconds())
    }
}

/// Parameters of one generation job. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct GenerationRequest {
    /// LRC-formatted lyrics.
    #[validate(length(min = 1, message = "lyrics must not be empty"))]
    pub lyrics: String,
    /// Name of the uploaded lyric file, when the lyrics arrived as a file.
    #[serde(default)]
    pub lyrics_file_name: Option<String>,
    /// Reference style prompt, e.g. `"pop ballad, emotional piano"`.
    #[validate(length(min = 1, message = "style prompt must not be empty"))]
    pub style_prompt: String,
    #[serde(default)]
    pub audio_length: AudioLength,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// Number of songs to generate in one run.
    #[serde(default = "default_batch_count")]
    #[validate(range(min = 1, message = "batch count must be at least 1"))]
    pub batch_count: u32,
    /// Chunked decoding trades speed for lower peak memory.
    #[serde(default = "default_chunked")]
    pub chunked: bool,
}

fn default_model_id() -> String {
    DEFAULT_MODEL_ID.to_owned()
}

fn default_batch_count() -> u32 {
    1
}

fn default_chunked() -> bool {
    true
}

impl GenerationRequest {
    /// A request with every optional parameter at its default.
    pub fn new(lyrics: impl Into<String>, style_prompt: impl Into<String>) -> Self {
        Self {
            lyrics: lyrics.into(),
            lyrics_file_name: None,
            style_prompt: style_prompt.into(),
            audio_length: AudioLength::default(),
            model_id: default_model_id(),
            batch_count: default_batch_count(),
            chunked: default_chunked(),
        }
    }

    pub fn with_audio_length(mut self, audio_length: AudioLength) -> Self {
        self.audio_length = audio_length;
        self
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn with_batch_count(mut self, batch_count: u32) -> Self {
        self.batch_count = batch_count;
        self
    }

    pub fn with_chunked(mut self, chunked: bool) -> Self {
        self.chunked = chunked;
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.lyrics_file_name = Some(file_name.into());
        self
    }

    /// Check every field, returning [`RuntimeError::Validation`] on the
    /// first problem found.
    pub fn check(&self, max_batch: u32) -> Result<(), RuntimeError> {
        self.validate().map_err(|e| invalid(e.to_string()))?;

        if self.lyrics.trim().is_empty() {
            return Err(invalid("lyrics must not be empty"));
        }
        if self.style_prompt.trim().is_empty() {
            return Err(invalid("style prompt must not be empty"));
        }
        if let Some(name) = &self.lyrics_file_name {
            if !name.to_ascii_lowercase().ends_with(".lrc") {
                return Err(invalid(format!("file must be an LRC file (got {name})")));
            }
        }
        if self.batch_count > max_batch {
            return Err(invalid(format!(
                "batch count must be between 1 and {max_batch} (got {})",
                self.batch_count
            )));
        }

        let model = catalog::lookup(&self.model_id)
            .ok_or_else(|| invalid(format!("unknown model: {}", self.model_id)))?;
        if self.audio_length.seconds() > model.max_length {
            return Err(invalid(format!(
                "model {} supports at most {}s (requested {})",
                model.id, model.max_length, self.audio_length
            )));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> RuntimeError {
    RuntimeError::Validation {
        message: message.into(),
    }
}
