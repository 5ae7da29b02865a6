use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Debug, Clone)]
pub struct PanelConfig {
    pub http_addr: String,
    pub db_path: String,
    pub jwt_secret: String,
    pub admin_user: Option<String>,
    pub admin_pass: Option<String>,
    pub setup_token: Option<String>,
    pub log_dir: String,
    /// Finished sync jobs retained per node.
    pub sync_job_keep: u64,
    pub node_monitor_interval_secs: u64,
    pub traffic_monitor_interval_secs: u64,
    pub offline_threshold: u32,
    pub node_request_timeout_secs: u64,
    pub subscription_base_url: Option<String>,
}

// Keys match the environment variable names, lowercased.
#[derive(Deserialize, Default, Debug)]
struct PartialPanelConfig {
    panel_http_addr: Option<String>,
    panel_db_path: Option<String>,
    panel_jwt_secret: Option<String>,
    admin_user: Option<String>,
    admin_pass: Option<String>,
    panel_setup_token: Option<String>,
    panel_log_dir: Option<String>,
    panel_sync_job_keep: Option<u64>,
    panel_node_monitor_interval_secs: Option<u64>,
    panel_traffic_monitor_interval_secs: Option<u64>,
    panel_offline_threshold: Option<u32>,
    panel_node_request_timeout_secs: Option<u64>,
    panel_subscription_base_url: Option<String>,
}

impl PanelConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self, String> {
        dotenv::dotenv().ok();

        // 1. File (optional)
        let file_config: PartialPanelConfig = match config_path {
            Some(path_str) if Path::new(path_str).exists() => {
                let contents = fs::read_to_string(path_str)
                    .map_err(|e| format!("Failed to read config file at {path_str:?}: {e}"))?;
                toml::from_str(&contents).map_err(|e| {
                    format!("Failed to parse TOML from config file at {path_str:?}: {e}")
                })?
            }
            _ => PartialPanelConfig::default(),
        };

        // 2. Environment
        let env_config: PartialPanelConfig = envy::from_env::<PartialPanelConfig>()
            .map_err(|e| format!("Failed to load config from environment: {e}"))?;

        // 3. Environment overrides file
        Self::merge(env_config, file_config)
    }

    fn merge(env: PartialPanelConfig, file: PartialPanelConfig) -> Result<Self, String> {
        let non_empty = |value: Option<String>| value.filter(|s| !s.trim().is_empty());

        Ok(PanelConfig {
            http_addr: env
                .panel_http_addr
                .or(file.panel_http_addr)
                .unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            db_path: env
                .panel_db_path
                .or(file.panel_db_path)
                .unwrap_or_else(|| "data/panel.db".to_string()),
            jwt_secret: non_empty(env.panel_jwt_secret.or(file.panel_jwt_secret))
                .ok_or("PANEL_JWT_SECRET is required")?,
            admin_user: non_empty(env.admin_user.or(file.admin_user)),
            admin_pass: non_empty(env.admin_pass.or(file.admin_pass)),
            setup_token: non_empty(env.panel_setup_token.or(file.panel_setup_token)),
            log_dir: env
                .panel_log_dir
                .or(file.panel_log_dir)
                .unwrap_or_else(|| "logs".to_string()),
            sync_job_keep: env
                .panel_sync_job_keep
                .or(file.panel_sync_job_keep)
                .unwrap_or(1)
                .max(1),
            node_monitor_interval_secs: env
                .panel_node_monitor_interval_secs
                .or(file.panel_node_monitor_interval_secs)
                .unwrap_or(30)
                .max(1),
            traffic_monitor_interval_secs: env
                .panel_traffic_monitor_interval_secs
                .or(file.panel_traffic_monitor_interval_secs)
                .unwrap_or(60)
                .max(1),
            offline_threshold: env
                .panel_offline_threshold
                .or(file.panel_offline_threshold)
                .unwrap_or(2)
                .max(1),
            node_request_timeout_secs: env
                .panel_node_request_timeout_secs
                .or(file.panel_node_request_timeout_secs)
                .unwrap_or(10)
                .max(1),
            subscription_base_url: non_empty(
                env.panel_subscription_base_url
                    .or(file.panel_subscription_base_url),
            ),
        })
    }

    /// sqlx URL for the configured database file, created on first open.
    pub fn database_url(&self) -> String {
        if self.db_path == ":memory:" {
            return "sqlite::memory:".to_string();
        }
        format!("sqlite://{}?mode=rwc", self.db_path)
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::merge(
            PartialPanelConfig {
                panel_jwt_secret: Some("test-secret".to_string()),
                panel_db_path: Some(":memory:".to_string()),
                panel_setup_token: Some("setup-token".to_string()),
                ..Default::default()
            },
            PartialPanelConfig::default(),
        )
        .expect("test config")
    }
}
