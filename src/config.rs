use std::collections::HashMap;
use std::env;
use std::fs;
use std::ops::RangeInclusive;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

pub const VOTE_SECONDS_RANGE: RangeInclusive<u64> = 10..=60;

const DEFAULT_TWITCH_SERVER: &str = "irc.chat.twitch.tv:6667";
const DEFAULT_WHITELIST_PATH: &str = "whitelist.json";
const DEFAULT_VOTE_SECONDS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("{0} must be an integer number of seconds")]
    InvalidVoteSeconds(&'static str),
    #[error("vote window of {0}s is outside the allowed range of 10-60 seconds")]
    VoteSecondsOutOfRange(u64),
    #[error("failed to read whitelist {path}: {source}")]
    WhitelistIo {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse whitelist {path}: {source}")]
    WhitelistFormat {
        path: String,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct TwitchConfig {
    pub server: String,
    pub token: String,
    pub nickname: String,
}

/// Authorization for one lichess account: the Twitch channel its games are
/// voted in, and an optional per-channel vote window override.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelGrant {
    pub channel: String,
    #[serde(default)]
    pub vote_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    grants: HashMap<String, ChannelGrant>,
}

impl Whitelist {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::WhitelistIo {
            path: path.display().to_string(),
            source,
        })?;
        let parsed: HashMap<String, ChannelGrant> =
            serde_json::from_str(&raw).map_err(|source| ConfigError::WhitelistFormat {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_grants(parsed)
    }

    fn from_grants(parsed: HashMap<String, ChannelGrant>) -> Result<Self, ConfigError> {
        let mut grants = HashMap::with_capacity(parsed.len());
        for (account, grant) in parsed {
            if let Some(vote_seconds) = grant.vote_seconds {
                if !VOTE_SECONDS_RANGE.contains(&vote_seconds) {
                    return Err(ConfigError::VoteSecondsOutOfRange(vote_seconds));
                }
            }
            grants.insert(
                account.trim().to_ascii_lowercase(),
                ChannelGrant {
                    channel: grant.channel.trim().to_ascii_lowercase(),
                    vote_seconds: grant.vote_seconds,
                },
            );
        }
        Ok(Self { grants })
    }

    pub fn grant_for(&self, lichess_account: &str) -> Option<&ChannelGrant> {
        self.grants
            .get(lichess_account.trim().to_ascii_lowercase().as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub lichess_token: String,
    pub lichess_account: String,
    pub twitch: TwitchConfig,
    pub whitelist: Whitelist,
    pub vote_seconds: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let lichess_token = require_var("LICHESS_TOKEN")?;
        let lichess_account = require_var("LICHESS_ACCOUNT")?.to_ascii_lowercase();
        let twitch = TwitchConfig {
            server: optional_var("TWITCH_SERVER")
                .unwrap_or_else(|| DEFAULT_TWITCH_SERVER.to_string()),
            token: require_var("TWITCH_TOKEN")?,
            nickname: require_var("TWITCH_NICKNAME")?,
        };

        let vote_seconds = match optional_var("VOTE_SECONDS") {
            Some(value) => value
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidVoteSeconds("VOTE_SECONDS"))?,
            None => DEFAULT_VOTE_SECONDS,
        };
        if !VOTE_SECONDS_RANGE.contains(&vote_seconds) {
            return Err(ConfigError::VoteSecondsOutOfRange(vote_seconds));
        }

        let whitelist_path =
            optional_var("WHITELIST_PATH").unwrap_or_else(|| DEFAULT_WHITELIST_PATH.to_string());
        let whitelist = Whitelist::load(Path::new(&whitelist_path))?;

        Ok(Self {
            lichess_token,
            lichess_account,
            twitch,
            whitelist,
            vote_seconds,
        })
    }
}

fn require_var(name: &'static str) -> Result<String, ConfigError> {
    optional_var(name).ok_or(ConfigError::MissingVar(name))
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
