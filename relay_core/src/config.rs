use crate::error::{RelayError, Result};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};
use url::Url;

pub const DEFAULT_CONFIG_PATH: &str = "config/relay.toml";

const DEFAULT_UPSTREAM_URL: &str = "https://www.blackbox.ai/api/chat";
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Linux; U; Android 4.3; en-us; SGH-T999 Build/JSS15J) AppleWebKit/534.30 (KHTML, like Gecko) Version/4.0 Mobile Safari/534.30";

/// Process-wide relay settings. Built once at startup and shared behind an `Arc`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_addr: String,
    pub max_retries: u32,
    pub upstream: UpstreamConfig,
    pub models: ModelTables,
    pub payload: PayloadDefaults,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub url: String,
    /// Sent in order on every upstream request.
    pub headers: Vec<(String, String)>,
}

/// Lookup tables keyed by the caller's `options.model`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelTables {
    pub agent_mode: HashMap<String, Map<String, Value>>,
    pub user_selected: HashMap<String, String>,
    pub param_overrides: HashMap<String, Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PayloadDefaults {
    pub default_temperature: f64,
    pub max_tokens: u64,
    pub top_p: f64,
}

/// Routing fields resolved for one model key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelRoute {
    pub trending_agent_mode: Map<String, Value>,
    pub user_selected_model: Option<String>,
    pub overrides: Map<String, Value>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            max_retries: 5,
            upstream: UpstreamConfig::default(),
            models: ModelTables::default(),
            payload: PayloadDefaults::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        let headers = [
            ("User-Agent", DEFAULT_USER_AGENT),
            ("Accept", "*/*"),
            ("Accept-Language", "en-US,en;q=0.5"),
            ("Referer", "https://www.blackbox.ai"),
            ("Content-Type", "application/json"),
            ("Origin", "https://www.blackbox.ai"),
            ("DNT", "1"),
            ("Sec-GPC", "1"),
            ("Alt-Used", "www.blackbox.ai"),
        ];
        Self {
            url: DEFAULT_UPSTREAM_URL.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl Default for ModelTables {
    fn default() -> Self {
        let agent = |id: &str| -> Map<String, Value> {
            match json!({ "mode": true, "id": id }) {
                Value::Object(map) => map,
                _ => Map::new(),
            }
        };
        let max_tokens = |n: u64| -> Map<String, Value> {
            let mut map = Map::new();
            map.insert("maxTokens".to_string(), json!(n));
            map
        };

        let agent_mode = HashMap::from([
            ("blackbox".to_string(), Map::new()),
            ("llama-3.1-405b".to_string(), agent("llama-3.1-405b")),
            ("llama-3.1-70b".to_string(), agent("llama-3.1-70b")),
            ("gemini-1.5-flash".to_string(), agent("Gemini")),
        ]);
        let user_selected = HashMap::from([
            ("gpt-4o".to_string(), "gpt-4o".to_string()),
            ("claude-3.5-sonnet".to_string(), "claude-sonnet-3.5".to_string()),
            ("gemini-pro".to_string(), "gemini-pro".to_string()),
        ]);
        let param_overrides = HashMap::from([
            ("gpt-4o".to_string(), max_tokens(4096)),
            ("claude-3.5-sonnet".to_string(), max_tokens(8192)),
            ("gemini-pro".to_string(), max_tokens(8192)),
        ]);

        Self {
            agent_mode,
            user_selected,
            param_overrides,
        }
    }
}

impl Default for PayloadDefaults {
    fn default() -> Self {
        Self {
            default_temperature: 0.7,
            max_tokens: 100_000,
            top_p: 0.9,
        }
    }
}

impl ModelTables {
    /// Unknown or missing keys resolve to an empty route.
    pub fn route(&self, model: Option<&str>) -> ModelRoute {
        let Some(model) = model else {
            return ModelRoute::default();
        };
        ModelRoute {
            trending_agent_mode: self.agent_mode.get(model).cloned().unwrap_or_default(),
            user_selected_model: self.user_selected.get(model).cloned(),
            overrides: self.param_overrides.get(model).cloned().unwrap_or_default(),
        }
    }
}

impl RelayConfig {
    /// Defaults, then the TOML file named by `RELAY_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("RELAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file(Path::new(&path))?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("relay config not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml(&content)
            .map_err(|e| RelayError::Config(format!("{}: {}", path.display(), e)))?;
        info!("loaded relay config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("RELAY_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(url) = lookup("RELAY_UPSTREAM_URL") {
            self.upstream.url = url;
        }
        if let Some(retries) = lookup("RELAY_MAX_RETRIES") {
            self.max_retries = retries.trim().parse().map_err(|_| {
                RelayError::Config(format!("RELAY_MAX_RETRIES is not a number: {}", retries))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.upstream.url)
            .map_err(|e| RelayError::Config(format!("upstream url {}: {}", self.upstream.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RelayError::Config(format!(
                "upstream url must be http(s): {}",
                self.upstream.url
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_upstream_contract() {
        let config = RelayConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.payload.default_temperature, 0.7);
        assert_eq!(config.payload.max_tokens, 100_000);
        assert!(
            config
                .upstream
                .headers
                .iter()
                .any(|(k, v)| k == "Content-Type" && v == "application/json")
        );
        config.validate().unwrap();
    }

    #[test]
    fn route_resolves_all_three_tables() {
        let tables = ModelTables::default();

        let route = tables.route(Some("gpt-4o"));
        assert!(route.trending_agent_mode.is_empty());
        assert_eq!(route.user_selected_model.as_deref(), Some("gpt-4o"));
        assert_eq!(route.overrides.get("maxTokens"), Some(&json!(4096)));

        let route = tables.route(Some("gemini-1.5-flash"));
        assert_eq!(route.trending_agent_mode.get("id"), Some(&json!("Gemini")));
        assert_eq!(route.trending_agent_mode.get("mode"), Some(&json!(true)));
        assert_eq!(route.user_selected_model, None);
        assert!(route.overrides.is_empty());
    }

    #[test]
    fn unknown_model_falls_back_to_empty_route() {
        let tables = ModelTables::default();
        assert_eq!(tables.route(Some("no-such-model")), ModelRoute::default());
        assert_eq!(tables.route(None), ModelRoute::default());
    }

    #[test]
    fn toml_overrides_replace_only_named_sections() {
        let config = RelayConfig::from_toml(
            r#"
            bind_addr = "127.0.0.1:8088"
            max_retries = 2

            [upstream]
            url = "http://localhost:9999/api/chat"
            headers = [["User-Agent", "relay-test"]]

            [models.user_selected]
            "mixtral" = "mixtral-8x7b"

            [models.param_overrides.mixtral]
            maxTokens = 2048
            playgroundTopP = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:8088");
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.upstream.headers, vec![("User-Agent".to_string(), "relay-test".to_string())]);
        let route = config.models.route(Some("mixtral"));
        assert_eq!(route.user_selected_model.as_deref(), Some("mixtral-8x7b"));
        assert_eq!(route.overrides.get("playgroundTopP"), Some(&json!(0.5)));
        // tables not named in the file keep their defaults
        assert!(config.models.agent_mode.contains_key("llama-3.1-70b"));
        assert_eq!(config.payload.top_p, 0.9);
    }

    #[test]
    fn env_overrides_win() {
        let mut config = RelayConfig::default();
        config
            .apply_env(|key| match key {
                "RELAY_BIND_ADDR" => Some("127.0.0.1:1".to_string()),
                "RELAY_MAX_RETRIES" => Some(" 0 ".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:1");
        assert_eq!(config.max_retries, 0);

        let err = config
            .apply_env(|key| (key == "RELAY_MAX_RETRIES").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn shipped_config_matches_builtin_defaults() {
        let shipped = RelayConfig::from_toml(include_str!("../config/relay.toml")).unwrap();
        let builtin = RelayConfig::default();
        assert_eq!(shipped.upstream.url, builtin.upstream.url);
        assert_eq!(shipped.upstream.headers, builtin.upstream.headers);
        assert_eq!(shipped.models.agent_mode, builtin.models.agent_mode);
        assert_eq!(shipped.models.user_selected, builtin.models.user_selected);
        assert_eq!(shipped.models.param_overrides, builtin.models.param_overrides);
        assert_eq!(shipped.payload.max_tokens, builtin.payload.max_tokens);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = RelayConfig::from_file(Path::new("definitely/not/here.toml")).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
    }

    #[test]
    fn non_http_upstream_is_rejected() {
        let mut config = RelayConfig::default();
        config.upstream.url = "ftp://example.com/chat".to_string();
        assert!(config.validate().is_err());
    }
}
