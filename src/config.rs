use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::find::DEFAULT_DISCOVERY_PORT;
use crate::session::{
    DEFAULT_DATALOADER_TFTP_PORT, DEFAULT_FIND_TIMEOUT, DEFAULT_STATUS_TIMEOUT,
    DEFAULT_TARGET_TFTP_PORT,
};
use crate::tftp::{DEFAULT_BLOCK_TIMEOUT, DEFAULT_MAX_RETRIES};

/// Optional per-command settings read from `.dataload.toml` in the
/// current directory. Command line arguments always win over values
/// from here.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub find: Option<FindConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<UploadConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FindConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

impl FindConfig {
    pub fn with_defaults() -> Self {
        Self {
            port: Some(DEFAULT_DISCOVERY_PORT),
            timeout: Some(DEFAULT_FIND_TIMEOUT),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UploadConfig {
    /// TFTP server port on the target hardware.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    /// Local TFTP server port the target pulls load files from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataloader_port: Option<u16>,
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub block_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub status_timeout: Option<Duration>,
    /// Continue the upload when the target asks for a file the load
    /// list does not provide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_missing: Option<bool>,
}

impl UploadConfig {
    pub fn with_defaults() -> Self {
        Self {
            target_port: Some(DEFAULT_TARGET_TFTP_PORT),
            dataloader_port: Some(DEFAULT_DATALOADER_TFTP_PORT),
            block_timeout: Some(DEFAULT_BLOCK_TIMEOUT),
            max_retries: Some(DEFAULT_MAX_RETRIES),
            status_timeout: Some(DEFAULT_STATUS_TIMEOUT),
            skip_missing: Some(false),
        }
    }
}

impl AppConfig {
    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn generate_config_file(force: bool) -> anyhow::Result<()> {
        use std::io::Write;

        let config_path = ".dataload.toml";

        if std::path::Path::new(config_path).exists() && !force {
            anyhow::bail!(
                "Configuration file {} already exists. Use --force to overwrite.",
                config_path
            );
        }

        let config_content = Self::generate_full_config();

        let mut file = fs::File::create(config_path)?;
        file.write_all(config_content.as_bytes())?;

        info!("Configuration file generated: {}", config_path);
        info!("Please edit this file to customize configuration");
        Ok(())
    }

    pub fn generate_full_config() -> String {
        let config = AppConfig {
            find: Some(FindConfig::with_defaults()),
            upload: Some(UploadConfig::with_defaults()),
        };
        let toml_content = toml::to_string_pretty(&config).unwrap();
        format!(
            "# dataload configuration file\n# All fields are optional, command line arguments override config file values\n\n{}",
            toml_content
        )
    }
}
