use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use snafu::Snafu;

pub const SECRET_ENV_PREFIX: &str = "COLLOQUY_";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SecretError {
    #[snafu(display("secret '{field}' for provider '{provider}' is not valid unicode"))]
    NotUnicode {
        stage: &'static str,
        provider: String,
        field: String,
    },
}

pub type SecretResult<T> = Result<T, SecretError>;

/// Source of provider credentials such as API keys.
pub trait SecretStore: Send + Sync {
    fn get_provider_secret(&self, provider: &str, field: &str) -> SecretResult<Option<String>>;
}

/// Secrets held in process memory, keyed by provider and field.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    values: Mutex<HashMap<(String, String), String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(self, provider: &str, field: &str, value: impl Into<String>) -> Self {
        self.set(provider, field, value);
        self
    }

    pub fn set(&self, provider: &str, field: &str, value: impl Into<String>) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(secret_key(provider, field), value.into());
    }
}

impl SecretStore for MemorySecretStore {
    fn get_provider_secret(&self, provider: &str, field: &str) -> SecretResult<Option<String>> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&secret_key(provider, field))
            .filter(|value| !value.trim().is_empty())
            .cloned())
    }
}

/// Reads `COLLOQUY_<PROVIDER>_<FIELD>` from the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretStore;

impl EnvSecretStore {
    pub fn variable_name(provider: &str, field: &str) -> String {
        format!(
            "{SECRET_ENV_PREFIX}{}_{}",
            env_segment(provider),
            env_segment(field)
        )
    }
}

impl SecretStore for EnvSecretStore {
    fn get_provider_secret(&self, provider: &str, field: &str) -> SecretResult<Option<String>> {
        let name = Self::variable_name(provider, field);
        match std::env::var(&name) {
            Ok(value) if value.trim().is_empty() => Ok(None),
            Ok(value) => Ok(Some(value.trim().to_string())),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(std::env::VarError::NotUnicode(_)) => NotUnicodeSnafu {
                stage: "env-secret-read",
                provider: provider.to_string(),
                field: field.to_string(),
            }
            .fail(),
        }
    }
}

fn secret_key(provider: &str, field: &str) -> (String, String) {
    (
        provider.trim().to_ascii_lowercase(),
        field.trim().to_ascii_lowercase(),
    )
}

fn env_segment(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|character| match character {
            '-' | '.' | ' ' => '_',
            other => other.to_ascii_uppercase(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_secrets_are_case_insensitive_and_hide_blanks() {
        let store = MemorySecretStore::new()
            .with_secret("OpenAI", "api_key", "sk-test")
            .with_secret("local", "api_key", "  ");

        assert_eq!(
            store.get_provider_secret("openai", "API_KEY").unwrap(),
            Some("sk-test".to_string())
        );
        assert_eq!(store.get_provider_secret("local", "api_key").unwrap(), None);
        assert_eq!(store.get_provider_secret("other", "api_key").unwrap(), None);
    }

    #[test]
    fn env_variable_names_are_normalized() {
        assert_eq!(
            EnvSecretStore::variable_name("openai-compatible", "api_key"),
            "COLLOQUY_OPENAI_COMPATIBLE_API_KEY"
        );
        assert_eq!(
            EnvSecretStore::variable_name(" rig.openai ", "base_url"),
            "COLLOQUY_RIG_OPENAI_BASE_URL"
        );
    }

    #[test]
    fn missing_env_secrets_are_none() {
        let store = EnvSecretStore;
        assert_eq!(
            store
                .get_provider_secret("provider-that-is-never-configured", "api_key")
                .unwrap(),
            None
        );
    }
}
