use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use regex::Regex;
use std::path::Path;

use super::schema::Config;
use crate::error::{ConfigError, Result};

const ENV_PREFIX: &str = "PLUGIN_SUPERVISOR_";

pub async fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file("plugin-supervisor.toml"))
        .merge(Json::file("plugin-supervisor.json"))
        .merge(Yaml::file("plugin-supervisor.yaml"))
        .merge(Yaml::file("plugin-supervisor.yml"))
        // e.g. PLUGIN_SUPERVISOR_LOGGING__LEVEL=debug
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    apply_env_substitutions(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::Parse(format!(
            "Configuration file not found: {}",
            path.display()
        ))
        .into());
    }

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    apply_env_substitutions(config)
}

pub fn validate(config: &Config) -> Result<()> {
    for (id, plugin) in &config.plugins {
        if id.trim().is_empty() {
            return Err(ConfigError::Validation("Plugin id must not be empty".into()).into());
        }
        if plugin.command.trim().is_empty() {
            return Err(
                ConfigError::Validation(format!("Plugin '{}' has empty command", id)).into(),
            );
        }
        if let Some((capability, _)) = plugin.shared_memory_hints.iter().find(|(_, bytes)| **bytes == 0) {
            return Err(ConfigError::Validation(format!(
                "Plugin '{}' has a zero shared memory hint for capability '{}'",
                id, capability
            ))
            .into());
        }
    }

    let thresholds = &config.backpressure;
    if !(thresholds.medium_threshold > 0.0
        && thresholds.medium_threshold < thresholds.high_threshold
        && thresholds.high_threshold <= 1.0)
    {
        return Err(ConfigError::Validation(
            "Backpressure thresholds must satisfy 0 < medium < high <= 1".into(),
        )
        .into());
    }

    if config.shared_memory.page_size == 0 {
        return Err(
            ConfigError::Validation("Shared memory page size must be greater than 0".into())
                .into(),
        );
    }

    let supervisor = &config.supervisor;
    let timeouts = [
        ("pingTimeoutMs", supervisor.ping_timeout_ms),
        ("registrationTimeoutMs", supervisor.registration_timeout_ms),
        (
            "registrationPollIntervalMs",
            supervisor.registration_poll_interval_ms,
        ),
        ("capabilitiesTimeoutMs", supervisor.capabilities_timeout_ms),
        ("callTimeoutMs", supervisor.call_timeout_ms),
        (
            "sessionRegistrationTimeoutMs",
            supervisor.session_registration_timeout_ms,
        ),
    ];
    if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
        return Err(ConfigError::Validation(format!(
            "supervisor.{} must be greater than 0",
            name
        ))
        .into());
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    let re = env_pattern()?;

    for plugin in config.plugins.values_mut() {
        plugin.command = substitute_env_vars(&re, &plugin.command)?;
        for arg in &mut plugin.args {
            *arg = substitute_env_vars(&re, arg)?;
        }
        for value in plugin.env.values_mut() {
            *value = substitute_env_vars(&re, value)?;
        }
    }

    Ok(config)
}

fn env_pattern() -> Result<Regex> {
    Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::Parse(e.to_string()).into())
}

/// Expand `${VAR}` and `${VAR:-default}` references.
fn substitute_env_vars(re: &Regex, input: &str) -> Result<String> {
    let mut result = input.to_string();

    for cap in re.captures_iter(input) {
        let reference = &cap[1];
        let (name, default) = match reference.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (reference, None),
        };

        let value = match (std::env::var(name), default) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.to_string(),
            (Err(_), None) => {
                return Err(ConfigError::EnvVar(format!(
                    "Environment variable '{}' not found",
                    name
                ))
                .into())
            }
        };
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}
