//! Settings for the `edit` command.
//!
//! clap resolves each value from the command line first, then the matching
//! `COWRITE_*` environment variable, then the built-in default. What is left
//! here is validation and the generated user id.

use crate::client::ClientConfig;
use clap::Args;
use cowrite_core::SessionConfig;
use std::path::PathBuf;
use thiserror::Error;

pub const ENV_SERVER: &str = "COWRITE_SERVER";
pub const ENV_CHANNEL: &str = "COWRITE_CHANNEL";
pub const ENV_NAME: &str = "COWRITE_NAME";
pub const ENV_USER_ID: &str = "COWRITE_USER_ID";
pub const ENV_STORE_DIR: &str = "COWRITE_STORE_DIR";

pub const DEFAULT_SERVER: &str = "ws://127.0.0.1:8080";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} cannot be empty")]
    Empty(&'static str),

    #[error("Invalid server URL {0:?}: expected ws:// or wss://")]
    InvalidServerUrl(String),
}

/// Arguments of the `edit` command.
#[derive(Args, Debug, Clone)]
pub struct EditArgs {
    /// Path to the text file to keep in sync
    #[arg(short, long)]
    pub file: PathBuf,

    /// Channel to join
    #[arg(short, long, env = ENV_CHANNEL)]
    pub channel: String,

    /// Display name
    #[arg(short, long, env = ENV_NAME)]
    pub name: String,

    /// User ID (generated if not provided)
    #[arg(long, env = ENV_USER_ID)]
    pub user_id: Option<String>,

    /// Relay server URL
    #[arg(short, long, env = ENV_SERVER, default_value = DEFAULT_SERVER)]
    pub server: String,

    /// Directory shared with other local editors for offline sync
    #[arg(long, env = ENV_STORE_DIR)]
    pub store_dir: Option<PathBuf>,
}

/// Fully resolved settings for one editing session.
#[derive(Debug, Clone)]
pub struct EditSettings {
    pub file: PathBuf,
    pub channel: String,
    pub name: String,
    pub user_id: String,
    pub server: String,
    pub store_dir: PathBuf,
}

impl EditSettings {
    pub fn resolve(args: EditArgs) -> Result<Self, ConfigError> {
        if args.channel.is_empty() {
            return Err(ConfigError::Empty("--channel"));
        }
        if args.name.is_empty() {
            return Err(ConfigError::Empty("--name"));
        }
        if !(args.server.starts_with("ws://") || args.server.starts_with("wss://")) {
            return Err(ConfigError::InvalidServerUrl(args.server));
        }

        let user_id = args
            .user_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let store_dir = args
            .store_dir
            .unwrap_or_else(|| std::env::temp_dir().join("cowrite"));

        Ok(Self {
            file: args.file,
            channel: args.channel,
            name: args.name,
            user_id,
            server: args.server,
            store_dir,
        })
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(
            self.server.clone(),
            SessionConfig::new(self.channel.clone(), self.user_id.clone(), self.name.clone()),
        )
    }
}
