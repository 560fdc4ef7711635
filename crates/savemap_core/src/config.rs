use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::path::TooBroadRules;

pub const DEFAULT_API_URL: &str = "https://www.pcgamingwiki.com/w/api.php";
pub const DEFAULT_USER_AGENT: &str = "savemap/0.1";
pub const DEFAULT_CATEGORY: &str = "Category:Games";
pub const DEFAULT_STEAM_COMMAND: &str = "python";
pub const DEFAULT_STEAM_SCRIPT: &str = "scripts/get-steam-app-info.py";
pub const DEFAULT_STEAM_BATCH_SIZE: usize = 25;
pub const DEFAULT_REQUEST_DELAY_MS: u64 = 1000;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CHECKPOINT_INTERVAL: usize = 250;
pub const DEFAULT_MAX_RETRIES: usize = 2;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SavemapConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub steam: SteamSection,
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub paths: PathsSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SteamSection {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RunSection {
    pub request_delay_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub checkpoint_interval: Option<usize>,
    pub max_retries: Option<usize>,
}

/// Additions to the built-in too-broad path list.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PathsSection {
    #[serde(default)]
    pub extra_too_broad: Vec<String>,
    #[serde(default)]
    pub extra_too_broad_prefixes: Vec<String>,
}

/// Load and parse a SavemapConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<SavemapConfig> {
    if !config_path.exists() {
        return Ok(SavemapConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: SavemapConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Every knob the pipeline reads, with defaults and environment overrides applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSettings {
    pub api_url: String,
    pub user_agent: String,
    pub category: String,
    pub timeout_ms: u64,
    pub request_delay_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub checkpoint_interval: usize,
    pub steam_command: String,
    pub steam_args: Vec<String>,
    pub steam_batch_size: usize,
    pub extra_too_broad: Vec<String>,
    pub extra_too_broad_prefixes: Vec<String>,
}

impl ResolvedSettings {
    pub fn too_broad_rules(&self) -> TooBroadRules {
        TooBroadRules::built_in().with_extra(
            self.extra_too_broad.iter().cloned(),
            self.extra_too_broad_prefixes.iter().cloned(),
        )
    }
}

/// Resolve settings: env > config > default.
pub fn resolve_settings(config: &SavemapConfig) -> Result<ResolvedSettings> {
    settings_with_lookup(config, |key| env::var(key).ok())
}

pub fn settings_with_lookup<F>(config: &SavemapConfig, lookup: F) -> Result<ResolvedSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let env_value = |key: &str| {
        lookup(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };
    let env_number = |key: &str| -> Result<Option<u64>> {
        match env_value(key) {
            Some(value) => value
                .parse::<u64>()
                .map(Some)
                .with_context(|| format!("{key} must be a non-negative integer, got `{value}`")),
            None => Ok(None),
        }
    };

    let batch_size = config.steam.batch_size.unwrap_or(DEFAULT_STEAM_BATCH_SIZE);
    if batch_size == 0 {
        bail!("steam.batch_size must be at least 1");
    }

    Ok(ResolvedSettings {
        api_url: env_value("SAVEMAP_WIKI_API_URL")
            .or_else(|| config.wiki.api_url.clone())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
        user_agent: env_value("SAVEMAP_USER_AGENT")
            .or_else(|| config.wiki.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        category: config
            .wiki
            .category
            .clone()
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
        timeout_ms: env_number("SAVEMAP_TIMEOUT_MS")?
            .or(config.run.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS),
        request_delay_ms: env_number("SAVEMAP_REQUEST_DELAY_MS")?
            .or(config.run.request_delay_ms)
            .unwrap_or(DEFAULT_REQUEST_DELAY_MS),
        max_retries: config.run.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        checkpoint_interval: config
            .run
            .checkpoint_interval
            .unwrap_or(DEFAULT_CHECKPOINT_INTERVAL),
        steam_command: config
            .steam
            .command
            .clone()
            .unwrap_or_else(|| DEFAULT_STEAM_COMMAND.to_string()),
        steam_args: config
            .steam
            .args
            .clone()
            .unwrap_or_else(|| vec![DEFAULT_STEAM_SCRIPT.to_string()]),
        steam_batch_size: batch_size,
        extra_too_broad: config.paths.extra_too_broad.clone(),
        extra_too_broad_prefixes: config.paths.extra_too_broad_prefixes.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values: BTreeMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| values.get(key).cloned()
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, SavemapConfig::default());
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[wiki]
api_url = "https://wiki.example.org/api.php"
user_agent = "test-agent/1.0"
category = "Category:Applications"

[steam]
command = "python3"
args = ["helper.py", "--quiet"]
batch_size = 10

[run]
request_delay_ms = 250
checkpoint_interval = 50

[paths]
extra_too_broad = ["<home>/Games"]
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.wiki.category.as_deref(), Some("Category:Applications"));
        assert_eq!(config.steam.batch_size, Some(10));
        assert_eq!(config.run.checkpoint_interval, Some(50));
        assert_eq!(config.paths.extra_too_broad, vec!["<home>/Games".to_string()]);
        assert!(config.paths.extra_too_broad_prefixes.is_empty());
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[wiki\napi_url = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn defaults_without_config_or_env() {
        let settings =
            settings_with_lookup(&SavemapConfig::default(), lookup(&[])).expect("settings");
        assert_eq!(settings.api_url, DEFAULT_API_URL);
        assert_eq!(settings.user_agent, "savemap/0.1");
        assert_eq!(settings.category, "Category:Games");
        assert_eq!(settings.request_delay_ms, 1000);
        assert_eq!(settings.checkpoint_interval, 250);
        assert_eq!(settings.steam_batch_size, 25);
        assert_eq!(settings.steam_args, vec![DEFAULT_STEAM_SCRIPT.to_string()]);
    }

    #[test]
    fn env_overrides_config() {
        let mut config = SavemapConfig::default();
        config.wiki.api_url = Some("https://config.example/api.php".to_string());
        config.run.request_delay_ms = Some(10);

        let settings = settings_with_lookup(
            &config,
            lookup(&[
                ("SAVEMAP_WIKI_API_URL", " https://env.example/api.php "),
                ("SAVEMAP_REQUEST_DELAY_MS", "0"),
                ("SAVEMAP_USER_AGENT", ""),
            ]),
        )
        .expect("settings");
        assert_eq!(settings.api_url, "https://env.example/api.php");
        assert_eq!(settings.request_delay_ms, 0);
        assert_eq!(settings.user_agent, DEFAULT_USER_AGENT);
    }

    #[test]
    fn malformed_env_number_is_an_error() {
        let error = settings_with_lookup(
            &SavemapConfig::default(),
            lookup(&[("SAVEMAP_TIMEOUT_MS", "soon")]),
        )
        .expect_err("must fail");
        assert!(error.to_string().contains("SAVEMAP_TIMEOUT_MS"));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut config = SavemapConfig::default();
        config.steam.batch_size = Some(0);
        assert!(settings_with_lookup(&config, lookup(&[])).is_err());
    }

    #[test]
    fn extra_too_broad_paths_extend_the_rules() {
        let mut config = SavemapConfig::default();
        config.paths.extra_too_broad = vec!["<home>/Games".to_string()];
        config.paths.extra_too_broad_prefixes = vec!["<home>/Shared/".to_string()];
        let rules = settings_with_lookup(&config, lookup(&[]))
            .expect("settings")
            .too_broad_rules();
        assert!(rules.is_too_broad("<home>/Games"));
        assert!(rules.is_too_broad("<home>/Shared/anything"));
        assert!(rules.is_too_broad("<home>/Documents"));
        assert!(!rules.is_too_broad("<home>/Games/Foo"));
    }
}
