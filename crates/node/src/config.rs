use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Debug, Clone)]
pub struct NodeConfig {
    pub http_addr: String,
    pub secret_key: String,
    pub log_level: String,
    pub log_dir: String,
    pub state_path: String,
    /// Empty means the interface of the default route.
    pub traffic_interface: String,
}

#[derive(Deserialize, Default, Debug)]
struct PartialNodeConfig {
    http_addr: Option<String>,
    secret_key: Option<String>,
    log_level: Option<String>,
    log_dir: Option<String>,
    state_path: Option<String>,
    traffic_interface: Option<String>,
}

fn default_http_addr() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_state_path() -> String {
    "data/last_config.json".to_string()
}

impl NodeConfig {
    /// File values first, `NODE_*` environment variables on top.
    pub fn load(config_path: Option<&str>) -> Result<Self, String> {
        dotenv::dotenv().ok();

        let file_config: PartialNodeConfig = match config_path {
            Some(path_str) if Path::new(path_str).exists() => {
                let contents = fs::read_to_string(path_str)
                    .map_err(|e| format!("Failed to read config file at {path_str:?}: {e}"))?;
                toml::from_str(&contents).map_err(|e| {
                    format!("Failed to parse TOML from config file at {path_str:?}: {e}")
                })?
            }
            _ => PartialNodeConfig::default(),
        };

        let env_config: PartialNodeConfig = envy::prefixed("NODE_")
            .from_env()
            .map_err(|e| format!("Failed to load config from environment: {e}"))?;

        Self::merge(env_config, file_config)
    }

    fn merge(env: PartialNodeConfig, file: PartialNodeConfig) -> Result<Self, String> {
        let secret_key = env
            .secret_key
            .or(file.secret_key)
            .filter(|s| !s.is_empty())
            .ok_or("NODE_SECRET_KEY is required")?;

        Ok(NodeConfig {
            http_addr: env
                .http_addr
                .or(file.http_addr)
                .unwrap_or_else(default_http_addr),
            secret_key,
            log_level: env
                .log_level
                .or(file.log_level)
                .unwrap_or_else(default_log_level),
            log_dir: env.log_dir.or(file.log_dir).unwrap_or_else(default_log_dir),
            state_path: env
                .state_path
                .or(file.state_path)
                .unwrap_or_else(default_state_path),
            traffic_interface: env
                .traffic_interface
                .or(file.traffic_interface)
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_file_and_defaults_fill_gaps() {
        let file: PartialNodeConfig = toml::from_str(
            r#"
            secret_key = "from-file"
            http_addr = "127.0.0.1:9000"
            traffic_interface = "eth1"
            "#,
        )
        .unwrap();
        let env = PartialNodeConfig {
            secret_key: Some("from-env".to_string()),
            ..Default::default()
        };

        let config = NodeConfig::merge(env, file).unwrap();
        assert_eq!(config.secret_key, "from-env");
        assert_eq!(config.http_addr, "127.0.0.1:9000");
        assert_eq!(config.traffic_interface, "eth1");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.state_path, "data/last_config.json");
    }

    #[test]
    fn secret_key_is_required() {
        let err = NodeConfig::merge(PartialNodeConfig::default(), PartialNodeConfig::default())
            .unwrap_err();
        assert!(err.contains("NODE_SECRET_KEY"));

        let blank = PartialNodeConfig {
            secret_key: Some(String::new()),
            ..Default::default()
        };
        assert!(NodeConfig::merge(blank, PartialNodeConfig::default()).is_err());
    }
}
