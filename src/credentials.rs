//! Credential lookup
//!
//! Environment variables win. Anything not set there is read from a single
//! JSON entry in the system keychain, so there is at most one keychain prompt
//! per process.

use crate::llm::Provider;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

const KEYRING_SERVICE: &str = "patchflow-credentials";
const KEYRING_USERNAME: &str = "default";

pub const GEMINI_API_KEY_ENV: &str = "GEMINI_API_KEY";
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";

/// Everything stored in the keychain entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct StoredCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gemini_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    openai_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    github_token: Option<String>,
}

type KeyringResult<T> = Result<T, String>;

static CREDENTIALS_CACHE: OnceLock<Mutex<Option<StoredCredentials>>> = OnceLock::new();
static KEYRING_ERROR_WARNED: AtomicBool = AtomicBool::new(false);

fn credentials_cache() -> &'static Mutex<Option<StoredCredentials>> {
    CREDENTIALS_CACHE.get_or_init(|| Mutex::new(None))
}

fn keyring_disabled() -> bool {
    if cfg!(test) {
        return true;
    }
    matches!(
        std::env::var("PATCHFLOW_DISABLE_KEYRING")
            .unwrap_or_default()
            .to_lowercase()
            .as_str(),
        "1" | "true" | "yes"
    )
}

fn keyring_entry() -> Result<Entry, keyring::Error> {
    Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)
}

/// Warn about keychain errors only once per process
fn warn_keychain_error_once(err: &str) {
    if KEYRING_ERROR_WARNED.swap(true, Ordering::Relaxed) {
        return;
    }
    tracing::warn!(
        error = err,
        "couldn't access system keychain; set {}, {} or {} to bypass it",
        GEMINI_API_KEY_ENV,
        OPENAI_API_KEY_ENV,
        GITHUB_TOKEN_ENV
    );
}

fn read_stored_uncached() -> KeyringResult<StoredCredentials> {
    if keyring_disabled() {
        return Ok(StoredCredentials::default());
    }
    let entry = keyring_entry().map_err(|e| e.to_string())?;
    match entry.get_password() {
        Ok(json) => {
            serde_json::from_str(&json).map_err(|e| format!("Failed to parse credentials: {}", e))
        }
        Err(keyring::Error::NoEntry) => Ok(StoredCredentials::default()),
        Err(err) => Err(err.to_string()),
    }
}

fn read_stored() -> KeyringResult<StoredCredentials> {
    let mut guard = credentials_cache()
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    if let Some(creds) = guard.as_ref() {
        return Ok(creds.clone());
    }
    let creds = read_stored_uncached()?;
    *guard = Some(creds.clone());
    Ok(creds)
}

/// Which secret a stored value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Gemini,
    OpenAi,
    GitHub,
}

impl CredentialKind {
    pub fn env_var(&self) -> &'static str {
        match self {
            CredentialKind::Gemini => GEMINI_API_KEY_ENV,
            CredentialKind::OpenAi => OPENAI_API_KEY_ENV,
            CredentialKind::GitHub => GITHUB_TOKEN_ENV,
        }
    }

    fn slot<'a>(&self, creds: &'a mut StoredCredentials) -> &'a mut Option<String> {
        match self {
            CredentialKind::Gemini => &mut creds.gemini_api_key,
            CredentialKind::OpenAi => &mut creds.openai_api_key,
            CredentialKind::GitHub => &mut creds.github_token,
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CredentialKind::Gemini => "gemini",
            CredentialKind::OpenAi => "openai",
            CredentialKind::GitHub => "github",
        })
    }
}

impl FromStr for CredentialKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(CredentialKind::Gemini),
            "openai" => Ok(CredentialKind::OpenAi),
            "github" => Ok(CredentialKind::GitHub),
            other => Err(format!("unknown credential: {} (expected gemini, openai or github)", other)),
        }
    }
}

/// Save one secret into the keychain entry, keeping the others.
pub fn store(kind: CredentialKind, value: &str) -> Result<(), String> {
    if keyring_disabled() {
        return Err("system keychain is disabled (PATCHFLOW_DISABLE_KEYRING)".to_string());
    }
    let mut creds = read_stored().unwrap_or_default();
    *kind.slot(&mut creds) = Some(value.to_string());

    let json = serde_json::to_string(&creds).map_err(|e| e.to_string())?;
    keyring_entry()
        .and_then(|entry| entry.set_password(&json))
        .map_err(|e| e.to_string())?;

    *credentials_cache().lock().unwrap_or_else(|e| e.into_inner()) = Some(creds);
    Ok(())
}

/// Resolved secrets for one process.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub gemini_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub github_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mask = |v: &Option<String>| if v.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("Credentials")
            .field("gemini_api_key", &mask(&self.gemini_api_key))
            .field("openai_api_key", &mask(&self.openai_api_key))
            .field("github_token", &mask(&self.github_token))
            .finish()
    }
}

impl Credentials {
    /// Environment first, then the keychain.
    pub fn resolve() -> Self {
        let stored = match read_stored() {
            Ok(stored) => stored,
            Err(err) => {
                warn_keychain_error_once(&err);
                StoredCredentials::default()
            }
        };
        Self::merge(|key| std::env::var(key).ok(), stored)
    }

    fn merge<F>(lookup: F, stored: StoredCredentials) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            gemini_api_key: env(GEMINI_API_KEY_ENV).or(stored.gemini_api_key),
            openai_api_key: env(OPENAI_API_KEY_ENV).or(stored.openai_api_key),
            github_token: env(GITHUB_TOKEN_ENV).or(stored.github_token),
        }
    }

    pub fn api_key(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::Gemini => self.gemini_api_key.as_deref(),
            Provider::OpenAi => self.openai_api_key.as_deref(),
            Provider::Ollama => None,
        }
    }
}
