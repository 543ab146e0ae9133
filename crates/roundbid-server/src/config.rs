// Configuration loading and parsing (auction.toml, server.toml, credentials.toml).

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use roundbid_core::model::{FinalizationMode, Role};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub auction: AuctionConfig,
    pub credentials: CredentialsConfig,
    pub ws_port: u16,
    pub db_path: String,
    pub event_channel_capacity: usize,
}

// ---------------------------------------------------------------------------
// auction.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AuctionConfig {
    pub rounds: RoundDefaults,
    #[serde(default)]
    pub teams: Vec<TeamSeed>,
}

/// Values used for rounds created without explicit overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct RoundDefaults {
    pub bid_increment: u32,
    pub max_bids_per_team: u32,
    pub finalization_mode: FinalizationMode,
}

/// A team registered with the engine at startup. Existing budgets are
/// never overwritten.
#[derive(Debug, Clone, Deserialize)]
pub struct TeamSeed {
    pub id: String,
    pub name: String,
    pub budget: u32,
}

// ---------------------------------------------------------------------------
// server.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire server.toml file.
#[derive(Debug, Clone, Deserialize)]
struct ServerFile {
    websocket: WebsocketSection,
    database: DatabaseSection,
    events: EventsSection,
}

#[derive(Debug, Clone, Deserialize)]
struct WebsocketSection {
    port: u16,
}

#[derive(Debug, Clone, Deserialize)]
struct DatabaseSection {
    path: String,
}

#[derive(Debug, Clone, Deserialize)]
struct EventsSection {
    channel_capacity: usize,
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub team_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/auction.toml`,
/// `config/server.toml`, and (optionally) `config/credentials.toml`, all
/// relative to the given `base_dir`.
///
/// This is the lower-level loading primitive that does not auto-copy defaults.
/// Prefer `load_config()` which handles default initialization automatically.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join("config");

    // --- auction.toml (required) ---
    let auction_path = config_dir.join("auction.toml");
    let auction_text = read_file(&auction_path)?;
    let auction: AuctionConfig =
        toml::from_str(&auction_text).map_err(|e| ConfigError::ParseError {
            path: auction_path.clone(),
            source: e,
        })?;

    // --- server.toml (required) ---
    let server_path = config_dir.join("server.toml");
    let server_text = read_file(&server_path)?;
    let server_file: ServerFile =
        toml::from_str(&server_text).map_err(|e| ConfigError::ParseError {
            path: server_path.clone(),
            source: e,
        })?;

    // --- credentials.toml (optional) ---
    let credentials_path = config_dir.join("credentials.toml");
    let credentials = if credentials_path.exists() {
        let cred_text = read_file(&credentials_path)?;
        toml::from_str(&cred_text).map_err(|e| ConfigError::ParseError {
            path: credentials_path.clone(),
            source: e,
        })?
    } else {
        CredentialsConfig::default()
    };

    let config = Config {
        auction,
        credentials,
        ws_port: server_file.websocket.port,
        db_path: server_file.database.path,
        event_channel_capacity: server_file.events.channel_capacity,
    };

    validate(&config)?;

    Ok(config)
}

/// Files `load_config_from` requires. Other files under `defaults/`, such as
/// `credentials.toml.example`, are templates an operator activates by hand.
const REQUIRED_FILES: [&str; 2] = ["auction.toml", "server.toml"];

/// Seed `config/` with any required file it lacks, taken from `defaults/`.
/// Files already in `config/` are never touched. Returns the paths written.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");

    if !defaults_dir.is_dir() {
        if config_dir.is_dir() {
            return Ok(vec![]);
        }
        return Err(ConfigError::DefaultsCopyError {
            message: format!(
                "neither defaults/ nor config/ directory found in {}; \
                 start the server from the roundbid-server crate directory",
                base_dir.display()
            ),
        });
    }

    std::fs::create_dir_all(&config_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to create {}: {e}", config_dir.display()),
    })?;

    let mut written = Vec::new();
    for name in REQUIRED_FILES {
        let source = defaults_dir.join(name);
        // A missing default surfaces later as FileNotFound for config/{name}.
        if !source.is_file() {
            continue;
        }
        let target = config_dir.join(name);
        if copy_if_missing(&source, &target)? {
            written.push(target);
        }
    }
    Ok(written)
}

fn copy_if_missing(source: &Path, target: &Path) -> Result<bool, ConfigError> {
    let copy_error = |message: String| ConfigError::DefaultsCopyError { message };
    let mut dest = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(copy_error(format!("failed to create {}: {e}", target.display()))),
    };
    let content = std::fs::read(source)
        .map_err(|e| copy_error(format!("failed to read {}: {e}", source.display())))?;
    std::io::Write::write_all(&mut dest, &content)
        .map_err(|e| copy_error(format!("failed to write {}: {e}", target.display())))?;
    Ok(true)
}

/// Convenience wrapper: loads config relative to the current working directory.
/// Ensures default config files are copied before loading.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

fn invalid(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.into(),
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    let rounds = &config.auction.rounds;
    if rounds.bid_increment == 0 {
        return Err(invalid("rounds.bid_increment", "must be greater than 0"));
    }
    if rounds.max_bids_per_team == 0 {
        return Err(invalid("rounds.max_bids_per_team", "must be greater than 0"));
    }

    let mut team_ids = HashSet::new();
    for (i, team) in config.auction.teams.iter().enumerate() {
        if team.id.trim().is_empty() {
            return Err(invalid(format!("teams[{i}].id"), "must not be empty"));
        }
        if !team_ids.insert(team.id.as_str()) {
            return Err(invalid(
                format!("teams[{i}].id"),
                format!("duplicate team id '{}'", team.id),
            ));
        }
    }

    if config.ws_port == 0 {
        return Err(invalid("websocket.port", "must be greater than 0"));
    }
    if config.db_path.trim().is_empty() {
        return Err(invalid("database.path", "must not be empty"));
    }
    if config.event_channel_capacity == 0 {
        return Err(invalid("events.channel_capacity", "must be greater than 0"));
    }

    let mut tokens = HashSet::new();
    for (i, entry) in config.credentials.tokens.iter().enumerate() {
        if entry.token.is_empty() {
            return Err(invalid(format!("tokens[{i}].token"), "must not be empty"));
        }
        if !tokens.insert(entry.token.as_str()) {
            return Err(invalid(format!("tokens[{i}].token"), "duplicate token"));
        }
        match (&entry.role, &entry.team_id) {
            (Role::Team, None) => {
                return Err(invalid(
                    format!("tokens[{i}].team_id"),
                    "required for team tokens",
                ));
            }
            (Role::Team, Some(team)) if !team_ids.contains(team.as_str()) => {
                return Err(invalid(
                    format!("tokens[{i}].team_id"),
                    format!("unknown team '{team}'"),
                ));
            }
            _ => {}
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
