//! Text generation backends
//!
//! The orchestrator only ever needs one capability from a model: turn a
//! prompt plus a system instruction into text. Each provider lives behind
//! [`TextGenerator`] so jobs can pick one per request.

pub mod client;
pub mod parse;
pub mod providers;

pub use client::{with_retry, RetryPolicy};
pub use parse::extract_json_payload;
pub use providers::{GeminiGenerator, OllamaGenerator, OpenAiGenerator};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gemini,
    OpenAi,
    Ollama,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Gemini, Provider::OpenAi, Provider::Ollama];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gemini => "gemini",
            Provider::OpenAi => "openai",
            Provider::Ollama => "ollama",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown provider: {0}")]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(Provider::Gemini),
            "openai" | "open-ai" => Ok(Provider::OpenAi),
            "ollama" => Ok(Provider::Ollama),
            _ => Err(UnknownProvider(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("{provider} credential is not configured")]
    MissingCredential { provider: Provider },
    #[error("{provider} returned HTTP {status}: {body}")]
    Http {
        provider: Provider,
        status: u16,
        body: String,
    },
    #[error("{provider} request failed: {message}")]
    Transport {
        provider: Provider,
        message: String,
        retryable: bool,
    },
    #[error("{provider} request timed out after {secs}s")]
    Timeout { provider: Provider, secs: u64 },
    #[error("could not decode {provider} response: {message}")]
    Decode { provider: Provider, message: String },
    #[error("{provider} returned no text")]
    Empty { provider: Provider },
    #[error("model output did not contain a usable patch: {message}")]
    Parse { message: String },
}

impl GenerationError {
    /// Timeouts, dropped connections, rate limits and 5xx are worth another try.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationError::Timeout { .. } => true,
            GenerationError::Transport { retryable, .. } => *retryable,
            GenerationError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Stable job error code.
    pub fn code(&self) -> &'static str {
        match self {
            GenerationError::Timeout { .. } => "GENERATION_TIMEOUT",
            GenerationError::Parse { .. } => "GENERATION_PARSE_FAILED",
            _ => "GENERATION_FAILED",
        }
    }
}

/// A model backend.
pub trait TextGenerator: Send + Sync {
    fn provider(&self) -> Provider;

    fn generate_text<'a>(
        &'a self,
        prompt: &'a str,
        system_instruction: &'a str,
    ) -> BoxFuture<'a, Result<String, GenerationError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_from_str_is_case_insensitive() {
        assert_eq!("Gemini".parse::<Provider>().unwrap(), Provider::Gemini);
        assert_eq!(" OPENAI ".parse::<Provider>().unwrap(), Provider::OpenAi);
        assert_eq!("ollama".parse::<Provider>().unwrap(), Provider::Ollama);
        assert!("claude".parse::<Provider>().is_err());
    }

    #[test]
    fn test_provider_serde_matches_as_str() {
        for provider in Provider::ALL {
            let json = serde_json::to_string(&provider).unwrap();
            assert_eq!(json, format!("\"{}\"", provider.as_str()));
        }
    }

    #[test]
    fn test_retryable_classification() {
        let http = |status| GenerationError::Http {
            provider: Provider::Gemini,
            status,
            body: String::new(),
        };
        assert!(http(429).is_retryable());
        assert!(http(503).is_retryable());
        assert!(!http(400).is_retryable());
        assert!(!http(401).is_retryable());
        assert!(GenerationError::Timeout {
            provider: Provider::Ollama,
            secs: 1
        }
        .is_retryable());
        assert!(!GenerationError::Parse {
            message: "x".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            GenerationError::Timeout {
                provider: Provider::Gemini,
                secs: 90
            }
            .code(),
            "GENERATION_TIMEOUT"
        );
        assert_eq!(
            GenerationError::Empty {
                provider: Provider::OpenAi
            }
            .code(),
            "GENERATION_FAILED"
        );
    }
}
