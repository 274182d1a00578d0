//! Core data models for the ingestion and answering pipelines.
//!
//! Statuses and roles that the observed schema kept as free strings are
//! closed enums here, parsed at the storage boundary.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Lifecycle of a document: `Processing` while chunking/embedding runs,
/// then `Ready` on success or `Error` on failure. `Error` documents can
/// only leave that state by being re-ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Processing,
    Ready,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Processing => "processing",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "processing" => Ok(DocumentStatus::Processing),
            "ready" | "completed" => Ok(DocumentStatus::Ready),
            "error" => Ok(DocumentStatus::Error),
            other => bail!("unknown document status: {}", other),
        }
    }

    /// Legal transitions. A document never goes Error -> Ready directly;
    /// re-ingestion moves it back through Processing first. Ready
    /// documents may re-enter Processing when re-embedded.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        matches!(
            (self, next),
            (DocumentStatus::Processing, DocumentStatus::Ready)
                | (DocumentStatus::Processing, DocumentStatus::Error)
                | (DocumentStatus::Error, DocumentStatus::Processing)
                | (DocumentStatus::Ready, DocumentStatus::Processing)
        )
    }
}

/// Tenant-scoped text artifact, mutated only by the ingestion pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub site_id: String,
    pub title: String,
    pub source_url: Option<String>,
    pub char_count: i64,
    pub chunk_count: i64,
    pub status: String,
    pub created_at: i64,
}

/// Chunker output: a bounded slice of document text, before embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub content: String,
    pub index: i64,
}

/// A stored chunk row joined back to its embedding by position.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub document_id: String,
    pub site_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub token_count: i64,
    pub title: String,
    pub embedding: Vec<f32>,
}

/// A chunk returned from similarity search.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub title: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "system" => Ok(ChatRole::System),
            "user" => Ok(ChatRole::User),
            "assistant" => Ok(ChatRole::Assistant),
            other => bail!("unknown chat role: {}", other),
        }
    }
}

/// One turn in the prompt sent to the completion provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: ChatRole,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Lightweight provenance attached to an assistant answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub content: String,
    pub document_title: String,
    pub similarity: f32,
}

/// Per-site AI configuration, stored as JSON in `site_configs`.
///
/// All fields are optional; the answering pipeline falls back to the
/// shared provider and the documented defaults (temperature 0.3,
/// max_tokens 1000) for anything unset. A custom provider is only used
/// when `api_key`, `base_url`, and `model` are all present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteAiConfig {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// USD per million input tokens.
    #[serde(default)]
    pub input_price: Option<f64>,
    /// USD per million output tokens.
    #[serde(default)]
    pub output_price: Option<f64>,
    #[serde(default)]
    pub assistant_name: Option<String>,
    #[serde(default)]
    pub welcome_message: Option<String>,
    #[serde(default)]
    pub brand_color: Option<String>,
}

impl SiteAiConfig {
    /// Custom completion credentials, when the site declared all three.
    pub fn custom_completion(&self) -> Option<(String, String, String)> {
        match (&self.api_key, &self.base_url, &self.model) {
            (Some(key), Some(url), Some(model))
                if !key.is_empty() && !url.is_empty() && !model.is_empty() =>
            {
                Some((key.clone(), url.clone(), model.clone()))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            DocumentStatus::Processing,
            DocumentStatus::Ready,
            DocumentStatus::Error,
        ] {
            assert_eq!(DocumentStatus::parse(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn completed_parses_as_ready() {
        assert_eq!(
            DocumentStatus::parse("completed").unwrap(),
            DocumentStatus::Ready
        );
    }

    #[test]
    fn error_to_ready_is_illegal() {
        assert!(!DocumentStatus::Error.can_transition_to(DocumentStatus::Ready));
        assert!(DocumentStatus::Error.can_transition_to(DocumentStatus::Processing));
        assert!(DocumentStatus::Processing.can_transition_to(DocumentStatus::Ready));
        assert!(DocumentStatus::Processing.can_transition_to(DocumentStatus::Error));
        assert!(DocumentStatus::Ready.can_transition_to(DocumentStatus::Processing));
        assert!(!DocumentStatus::Ready.can_transition_to(DocumentStatus::Error));
    }

    #[test]
    fn custom_completion_requires_all_three() {
        let mut config = SiteAiConfig {
            api_key: Some("sk-test".into()),
            base_url: Some("https://api.example.com/v1".into()),
            ..Default::default()
        };
        assert!(config.custom_completion().is_none());

        config.model = Some("my-model".into());
        assert!(config.custom_completion().is_some());

        config.api_key = Some(String::new());
        assert!(config.custom_completion().is_none());
    }

    #[test]
    fn role_serializes_lowercase() {
        let msg = PromptMessage::user("hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
    }
}
