use super::schemas::Config;
/// Configuration loading, reloading and access helpers
///
/// The binaries load the file once into the global `CONFIG`; library
/// components never read the global themselves, they receive the values
/// they need when constructed.
use crate::errors::GatewayError;
use crate::logger::{self, LogTag};
use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::RwLock;

pub static CONFIG: OnceCell<RwLock<Config>> = OnceCell::new();

pub const CONFIG_FILE_PATH: &str = "data/config.toml";

/// Parse a TOML document into a `Config`, filling gaps with defaults
pub fn parse_config(contents: &str) -> Result<Config, GatewayError> {
    toml::from_str::<Config>(contents)
        .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
}

/// Keys present in the document that no section accepts (`section.key`)
pub fn unknown_keys(contents: &str) -> Vec<String> {
    let Ok(table) = toml::from_str::<toml::Table>(contents) else {
        return Vec::new();
    };

    let mut unknown = Vec::new();
    for (section, value) in &table {
        match (Config::section_fields(section), value.as_table()) {
            (Some(fields), Some(entries)) => {
                for key in entries.keys() {
                    if !fields.contains(&key.as_str()) {
                        unknown.push(format!("{}.{}", section, key));
                    }
                }
            }
            _ => unknown.push(section.clone()),
        }
    }
    unknown
}

/// Read a config file; a missing file yields the defaults
pub fn read_config_file(path: &str) -> Result<Config, GatewayError> {
    if !Path::new(path).exists() {
        logger::warning(
            LogTag::System,
            &format!("Config file '{}' not found, using default values", path),
        );
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::Config(format!("Failed to read config file '{}': {}", path, e)))?;

    for key in unknown_keys(&contents) {
        logger::warning(
            LogTag::System,
            &format!("Ignoring unknown config key '{}' in {}", key, path),
        );
    }

    parse_config(&contents)
}

pub fn load_config() -> Result<(), GatewayError> {
    load_config_from_path(CONFIG_FILE_PATH)
}

/// Load a config file into the global `CONFIG` (replacing any previous value)
pub fn load_config_from_path(path: &str) -> Result<(), GatewayError> {
    let config = read_config_file(path)?;
    store(config)
}

/// Re-read the file and atomically replace the global value
pub fn reload_config_from_path(path: &str) -> Result<(), GatewayError> {
    if CONFIG.get().is_none() {
        return Err(GatewayError::Config(
            "Config not initialized. Call load_config() first.".to_string(),
        ));
    }
    let config = read_config_file(path)?;
    store(config)
}

fn store(config: Config) -> Result<(), GatewayError> {
    match CONFIG.get() {
        Some(lock) => {
            let mut current = lock
                .write()
                .map_err(|e| GatewayError::Config(format!("Config lock poisoned: {}", e)))?;
            *current = config;
            Ok(())
        }
        None => {
            // A concurrent initializer may win the race; fall back to replacing its value
            if let Err(lock) = CONFIG.set(RwLock::new(config.clone())) {
                drop(lock);
                return store(config);
            }
            Ok(())
        }
    }
}

/// Read access to the global configuration (defaults if never loaded)
pub fn with_config<F, R>(f: F) -> R
where
    F: FnOnce(&Config) -> R,
{
    let lock = CONFIG.get_or_init(|| RwLock::new(Config::default()));
    match lock.read() {
        Ok(cfg) => f(&cfg),
        Err(poisoned) => f(&poisoned.into_inner()),
    }
}

pub fn get_config_clone() -> Config {
    with_config(|cfg| cfg.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = parse_config(
            r#"
            [reconnect]
            enabled = false
            max_attempts = 3

            [persistence]
            base_url = "https://assets.example.com/api"
            "#,
        )
        .unwrap();

        assert!(!config.reconnect.enabled);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.initial_delay_ms, 1_000);
        assert_eq!(config.persistence.base_url, "https://assets.example.com/api");
        assert_eq!(config.commands, Default::default());
    }

    #[test]
    fn test_unknown_keys_reported() {
        let doc = r#"
            [connection]
            connect_timeout_ms = 500
            conect_timeout = 1

            [metrics]
            enabled = true
        "#;
        let mut unknown = unknown_keys(doc);
        unknown.sort();
        assert_eq!(unknown, vec!["connection.conect_timeout", "metrics"]);
    }

    #[test]
    fn test_read_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[commands]\ndefault_timeout_ms = 2500").unwrap();

        let config = read_config_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.commands.default_timeout_ms, 2500);

        let missing = read_config_file("/nonexistent/gatewaylink.toml").unwrap();
        assert_eq!(missing, Config::default());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = parse_config("[reconnect\nenabled = yes").unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
