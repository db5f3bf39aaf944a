use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Gateway access tokens as "user:token;user2:token2". Empty disables auth.
    #[serde(default)]
    pub api_keys: String,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "ProviderConfig::anthropic")]
    pub anthropic: ProviderConfig,
    #[serde(default = "ProviderConfig::gemini")]
    pub gemini: ProviderConfig,
    #[serde(default = "ProviderConfig::grok")]
    pub grok: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            anthropic: ProviderConfig::anthropic(),
            gemini: ProviderConfig::gemini(),
            grok: ProviderConfig::grok(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key_env: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl ProviderConfig {
    fn anthropic() -> Self {
        Self {
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: None,
        }
    }

    fn gemini() -> Self {
        Self {
            api_key_env: "GOOGLE_API_KEY".to_string(),
            base_url: None,
        }
    }

    fn grok() -> Self {
        Self {
            api_key_env: "XAI_API_KEY".to_string(),
            base_url: None,
        }
    }

    /// Resolve the provider key from its environment variable. An unset or
    /// empty variable means the provider is simply not configured.
    pub fn resolve_api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_keys: String::new(),
            providers: ProvidersConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir. No file anywhere
    /// falls back to defaults; the gateway runs fine on env vars alone.
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        for candidate in config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(&candidate);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// The gateway token table, with the API_KEYS environment variable
    /// taking precedence over the config file.
    pub fn effective_api_keys(&self) -> String {
        std::env::var("API_KEYS").unwrap_or_else(|_| self.api_keys.clone())
    }
}

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("chat-bridge.toml"));

    // XDG / platform config dir
    if cfg!(target_os = "macos") {
        if let Some(home) = dirs_path() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join("chat-bridge")
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join("chat-bridge").join("config.toml"));
        }
        if let Some(home) = dirs_path() {
            paths.push(
                home.join(".config")
                    .join("chat-bridge")
                    .join("config.toml"),
            );
        }
    }

    // Home directory fallback
    if let Some(home) = dirs_path() {
        paths.push(home.join(".chat-bridge.toml"));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
host = "127.0.0.1"
port = 9000
api_keys = "alice:secret1;bob:secret2"

[providers.anthropic]
api_key_env = "MY_ANTHROPIC_KEY"

[providers.grok]
api_key_env = "XAI_API_KEY"
base_url = "https://grok.example.com/v1"
"#
        )
        .unwrap();

        let config = GatewayConfig::load(f.path()).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.api_keys, "alice:secret1;bob:secret2");
        assert_eq!(config.providers.anthropic.api_key_env, "MY_ANTHROPIC_KEY");
        assert_eq!(
            config.providers.grok.base_url.as_deref(),
            Some("https://grok.example.com/v1")
        );
        // Untouched table keeps its defaults.
        assert_eq!(config.providers.gemini.api_key_env, "GOOGLE_API_KEY");
    }

    #[test]
    fn test_defaults() {
        let config: GatewayConfig = toml::from_str("").unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8000);
        assert!(config.api_keys.is_empty());
        assert_eq!(config.providers.anthropic.api_key_env, "ANTHROPIC_API_KEY");
        assert!(config.providers.anthropic.base_url.is_none());
    }

    #[test]
    fn test_invalid_toml_rejected() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "port = \"not a number\"").unwrap();
        assert!(GatewayConfig::load(f.path()).is_err());
    }
}
