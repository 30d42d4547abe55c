use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use colloquy_llm::{BASE_URL_FIELD, ProviderConfig, ProviderRegistry};
use colloquy_storage::ConversationSettings;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "colloquy";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "colloquy.db";
pub const SETTINGS_ENV_PREFIX: &str = "COLLOQUY_";
pub const DEFAULT_PROVIDER: &str = "openai";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Extra provider name bound to a built-in provider kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpointSettings {
    pub provider_id: String,
    #[serde(default = "default_provider_kind")]
    pub kind: String,
    #[serde(default)]
    pub base_url: String,
}

impl ProviderEndpointSettings {
    fn normalized(mut self) -> Option<Self> {
        self.provider_id = self.provider_id.trim().to_ascii_lowercase();
        if self.provider_id.is_empty() {
            return None;
        }
        self.kind = if self.kind.trim().is_empty() {
            default_provider_kind()
        } else {
            self.kind.trim().to_ascii_lowercase()
        };
        self.base_url = self.base_url.trim().to_string();
        Some(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default = "default_provider")]
    pub default_provider: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub providers: Vec<ProviderEndpointSettings>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            log_filter: default_log_filter(),
            default_provider: default_provider(),
            default_model: default_model(),
            temperature: None,
            max_tokens: None,
            system_prompt: None,
            providers: Vec::new(),
        }
    }
}

impl AppSettings {
    pub fn normalized(mut self) -> Self {
        self.database_path = if self.database_path.trim().is_empty() {
            default_database_path()
        } else {
            self.database_path.trim().to_string()
        };
        self.log_filter = if self.log_filter.trim().is_empty() {
            default_log_filter()
        } else {
            self.log_filter.trim().to_string()
        };
        // An empty default provider is allowed and means "no replies".
        self.default_provider = self.default_provider.trim().to_string();
        self.default_model = if self.default_model.trim().is_empty() {
            default_model()
        } else {
            self.default_model.trim().to_string()
        };
        self.system_prompt = self
            .system_prompt
            .map(|prompt| prompt.trim().to_string())
            .filter(|prompt| !prompt.is_empty());
        self.providers = self
            .providers
            .into_iter()
            .filter_map(ProviderEndpointSettings::normalized)
            .collect();
        self
    }

    /// Settings applied to newly created conversations.
    pub fn conversation_defaults(&self) -> ConversationSettings {
        ConversationSettings {
            provider: self.default_provider.clone(),
            model: self.default_model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            system_prompt: self.system_prompt.clone(),
        }
    }

    /// Built-in providers plus every configured endpoint whose kind is known.
    pub fn provider_registry(&self) -> ProviderRegistry {
        let builtin = ProviderRegistry::with_builtin();
        let mut registry = builtin.clone();

        for endpoint in &self.providers {
            let Ok(kind) = builtin.resolve(&endpoint.kind) else {
                tracing::warn!(
                    provider = %endpoint.provider_id,
                    kind = %endpoint.kind,
                    "skipping provider endpoint with unknown kind"
                );
                continue;
            };

            let mut config = ProviderConfig::new(&endpoint.provider_id);
            if !endpoint.base_url.is_empty() {
                config.set(BASE_URL_FIELD, &endpoint.base_url);
            }
            registry.register(&endpoint.provider_id, kind.factory.clone(), config);
        }

        registry
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<AppSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".colloquy"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: AppSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> AppSettings {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        // A missing file contributes nothing, so environment overrides still apply.
        let figment = Figment::from(Serialized::defaults(AppSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(SETTINGS_ENV_PREFIX).only(&[
                "database_path",
                "log_filter",
                "default_provider",
                "default_model",
                "temperature",
                "max_tokens",
                "system_prompt",
            ]));

        match figment.extract::<AppSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                AppSettings::default()
            }
        }
    }

    fn persist(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_database_path() -> String {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME).join(DATABASE_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(".colloquy").join(DATABASE_FILE_NAME))
        .to_string_lossy()
        .into_owned()
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_provider_kind() -> String {
    colloquy_llm::RIG_OPENAI_PROVIDER_ID.to_string()
}
