//! Bot configuration, fixed for the life of the process.

use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;

use crate::error::ConfigError;
use crate::session::DEFAULT_URL_TEMPLATE;

/// Reactions picked from when no set is configured.
pub const DEFAULT_REACTIONS: &[&str] = &[
    "👍", "❤️", "😂", "😮", "😢", "🙏", "🔥", "🎉", "💯", "👏", "😍", "🤝",
];

/// Browser triple announced to the server.
pub const DEFAULT_BROWSER: [&str; 3] = ["RCD-MD", "safari", "3.3"];

/// Who the bot answers. Forwarded to the backend as a visibility flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Public,
    Private,
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "private" => Ok(Self::Private),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Public => "public",
            Self::Private => "private",
        })
    }
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub mode: Mode,
    pub auto_react: bool,
    /// Remote session id used when no local bundle exists.
    pub session_id: Option<String>,
    pub session_dir: PathBuf,
    /// URL with an `{id}` placeholder for `session_id`.
    pub session_url_template: String,
    pub reactions: Vec<String>,
    pub browser: [String; 3],
    /// Fall back to the backend's pairing flow when no credentials exist.
    pub allow_pairing: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            auto_react: false,
            session_id: None,
            session_dir: PathBuf::from("session"),
            session_url_template: DEFAULT_URL_TEMPLATE.to_string(),
            reactions: DEFAULT_REACTIONS.iter().map(|s| s.to_string()).collect(),
            browser: DEFAULT_BROWSER.map(String::from),
            allow_pairing: false,
        }
    }
}

impl BotConfig {
    /// Check invariants once at startup. Blank reaction entries are dropped.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        self.reactions = self
            .reactions
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        if self.reactions.is_empty() {
            return Err(ConfigError::EmptyReactions);
        }
        if !self.session_url_template.contains("{id}") {
            return Err(ConfigError::BadUrlTemplate(self.session_url_template));
        }
        if let Some(id) = &self.session_id {
            if id.trim().is_empty() {
                return Err(ConfigError::BlankSessionId);
            }
        }
        Ok(self)
    }

    pub fn is_public(&self) -> bool {
        self.mode == Mode::Public
    }
}
