use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    #[serde(default = "default_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    /// Consumer label attached to every line request.
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_chip")]
    pub chip: String,
    #[serde(default = "default_db_dir")]
    pub db_dir: String,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_path() -> String {
    "/api".to_string()
}

fn default_app_name() -> String {
    "RaspController".to_string()
}

fn default_chip() -> String {
    "gpiochip0".to_string()
}

fn default_db_dir() -> String {
    "/tmp/raspctl".to_string()
}

fn default_cache_ttl_secs() -> u64 {
    1
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, AppError> {
        let config: AppConfig = serde_json::from_str(contents)
            .map_err(|e| AppError::Config(format!("Invalid config json: {e}")))?;
        if config.http.host.is_none() && config.http.unix_socket.is_none() {
            return Err(AppError::Config(
                "either 'host' or 'unix_socket' must be specified".into(),
            ));
        }
        Ok(config)
    }
}
