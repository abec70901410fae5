use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use parley_llm::Provider;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const CONFIG_DIRECTORY_NAME: &str = "parley";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const DATABASE_FILE_NAME: &str = "parley.db";
pub const ENV_PREFIX: &str = "PARLEY_";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u64 = 2000;

/// Runtime configuration. Per-user overrides live in the settings store instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub groq_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub temperature: f64,
    pub max_tokens: u64,
    pub database_path: Option<PathBuf>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            groq_api_key: None,
            google_api_key: None,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            database_path: None,
        }
    }
}

impl ChatConfig {
    /// Layers, lowest precedence first: defaults, JSON file, bare provider key
    /// variables, then `PARLEY_`-prefixed variables.
    pub fn figment(config_path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ChatConfig::default()))
            .merge(Json::file(config_path))
            .merge(Env::raw().only(&[Provider::Groq.env_var(), Provider::Google.env_var()]))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        Self::figment(config_path)
            .extract::<ChatConfig>()
            .map(Self::normalized)
            .context(ExtractSnafu {
                stage: "extract-chat-config",
                path: config_path.to_path_buf(),
            })
    }

    pub fn normalized(mut self) -> Self {
        self.groq_api_key = Provider::Groq.usable_credential(self.groq_api_key.as_deref());
        self.google_api_key = Provider::Google.usable_credential(self.google_api_key.as_deref());
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            self.temperature = DEFAULT_TEMPERATURE;
        }
        if self.max_tokens == 0 {
            self.max_tokens = DEFAULT_MAX_TOKENS;
        }
        self
    }

    /// Default credential for `provider`, used when the settings hold no override.
    pub fn credential(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::Groq => self.groq_api_key.as_deref(),
            Provider::Google => self.google_api_key.as_deref(),
        }
    }

    pub fn database_location(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(ChatConfigStore::default_database_path)
    }
}

/// Lock-free snapshot holder; streaming tasks read it while the config reloads.
#[derive(Debug, Clone)]
pub struct ChatConfigStore {
    config: Arc<ArcSwap<ChatConfig>>,
    config_path: PathBuf,
}

impl ChatConfigStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(CONFIG_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(CONFIG_FILE_NAME)
    }

    pub fn default_database_path() -> PathBuf {
        dirs::data_dir()
            .map(|path| path.join(CONFIG_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
            .join(DATABASE_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let config = Self::load_or_default(&config_path);
        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    /// Store seeded with `config`; reloads still read from the default path.
    pub fn from_config(config: ChatConfig) -> Self {
        Self {
            config: Arc::new(ArcSwap::from_pointee(config.normalized())),
            config_path: Self::default_config_path(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn current(&self) -> Arc<ChatConfig> {
        self.config.load_full()
    }

    pub fn reload(&self) -> Result<Arc<ChatConfig>, ConfigError> {
        let config = Arc::new(ChatConfig::load(&self.config_path)?);
        self.config.store(config.clone());
        tracing::info!(path = ?self.config_path, "reloaded chat config");
        Ok(config)
    }

    pub fn update(&self, config: ChatConfig) -> Result<(), ConfigError> {
        let normalized_config = config.normalized();
        self.persist(&normalized_config)?;
        self.config.store(Arc::new(normalized_config));
        Ok(())
    }

    fn load_or_default(path: &Path) -> ChatConfig {
        match ChatConfig::load(path) {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!(path = ?path, error = %error, "failed to load chat config, using defaults");
                ChatConfig::default()
            }
        }
    }

    fn persist(&self, config: &ChatConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-config-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(config).context(SerializeConfigSnafu {
            stage: "serialize-config-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-config-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-config-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved chat config");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to read chat config from {path:?} on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        path: PathBuf,
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },
    #[snafu(display("failed to create config directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize config on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write config file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace config file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn clear_provider_env(jail: &mut Jail) {
        jail.set_env("GROQ_API_KEY", "");
        jail.set_env("GOOGLE_API_KEY", "");
    }

    #[test]
    fn defaults_apply_without_file_or_env() {
        Jail::expect_with(|jail| {
            clear_provider_env(jail);

            let config = ChatConfig::load(Path::new("missing.json")).unwrap();

            assert_eq!(config.temperature, 0.7);
            assert_eq!(config.max_tokens, 2000);
            assert_eq!(config.groq_api_key, None);
            assert_eq!(config.google_api_key, None);
            Ok(())
        });
    }

    #[test]
    fn env_layers_override_file_values() {
        Jail::expect_with(|jail| {
            clear_provider_env(jail);
            jail.create_file(
                "config.json",
                r#"{ "temperature": 0.2, "max_tokens": 900, "groq_api_key": "from-file" }"#,
            )?;
            jail.set_env("GROQ_API_KEY", "from-env");
            jail.set_env("PARLEY_MAX_TOKENS", "512");

            let config = ChatConfig::load(Path::new("config.json")).unwrap();

            assert_eq!(config.temperature, 0.2);
            assert_eq!(config.max_tokens, 512);
            assert_eq!(config.credential(Provider::Groq), Some("from-env"));
            Ok(())
        });
    }

    #[test]
    fn placeholder_credentials_count_as_unset() {
        Jail::expect_with(|jail| {
            clear_provider_env(jail);
            jail.set_env("GROQ_API_KEY", "your_groq_api_key_here");
            jail.set_env("GOOGLE_API_KEY", "  real-google-key ");

            let config = ChatConfig::load(Path::new("absent.json")).unwrap();

            assert_eq!(config.credential(Provider::Groq), None);
            assert_eq!(config.credential(Provider::Google), Some("real-google-key"));
            Ok(())
        });
    }

    #[test]
    fn update_persists_and_reload_reads_it_back() {
        Jail::expect_with(|jail| {
            clear_provider_env(jail);
            let path = jail.directory().join("nested").join(CONFIG_FILE_NAME);
            let store = ChatConfigStore::new(path.clone());

            store
                .update(ChatConfig {
                    temperature: 1.1,
                    ..ChatConfig::default()
                })
                .unwrap();
            let reloaded = ChatConfigStore::new(path).reload().unwrap();

            assert_eq!(store.current().temperature, 1.1);
            assert_eq!(reloaded.temperature, 1.1);
            Ok(())
        });
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let config = ChatConfig {
            temperature: f64::NAN,
            max_tokens: 0,
            ..ChatConfig::default()
        }
        .normalized();

        assert_eq!(config.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(config.max_tokens, DEFAULT_MAX_TOKENS);
    }
}
