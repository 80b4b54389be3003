//! wabot: keeps one WhatsApp Web session alive and runs the bot on it.
//!
//! Credentials come from `<session-dir>/creds.json`, or are downloaded once
//! from the session host using `SESSION_ID`. The protocol itself is spoken
//! by a sidecar reachable at `BRIDGE_ADDR`. Exits 0 when the account is
//! logged out and 1 when startup fails or the account is forbidden.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use clap::builder::BoolishValueParser;
use tracing_subscriber::EnvFilter;
use wabot_core::autoreact::{AutoReactionEngine, SUBSCRIBER_NAME};
use wabot_core::bridge::{BridgeBackend, BridgeConfig, DEFAULT_BRIDGE_ADDR, DEFAULT_VERSION_URL};
use wabot_core::config::{BotConfig, DEFAULT_BROWSER, DEFAULT_REACTIONS, Mode};
use wabot_core::session::{DEFAULT_URL_TEMPLATE, RemoteSource, SessionStore};
use wabot_core::{ConnectionSupervisor, EventDispatcher, ReconnectConfig};

use wabot::handlers::{self, HandlerSettings};
use wabot::health::{self, HealthState};

#[derive(Parser)]
#[command(name = "wabot", about = "WhatsApp Web bot with auto reactions")]
struct Args {
    /// Remote session id, used when no local credentials exist
    #[arg(long, env = "SESSION_ID")]
    session_id: Option<String>,

    /// Who the bot answers: public or private
    #[arg(long, env = "MODE", default_value = "public")]
    mode: Mode,

    /// React to incoming messages with a random emoji
    #[arg(long, env = "AUTO_REACT", default_value_t = false, value_parser = BoolishValueParser::new())]
    auto_react: bool,

    /// Port for the liveness endpoint
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Directory holding creds.json
    #[arg(long, env = "SESSION_DIR", default_value = "session")]
    session_dir: PathBuf,

    /// Session download URL; `{id}` is replaced by the session id
    #[arg(long, env = "SESSION_URL_TEMPLATE", default_value = DEFAULT_URL_TEMPLATE)]
    session_url_template: String,

    /// Comma-separated reaction set (defaults to a built-in set)
    #[arg(long, env = "REACTIONS", value_delimiter = ',')]
    reactions: Vec<String>,

    /// Protocol sidecar address (host:port)
    #[arg(long, env = "BRIDGE_ADDR", default_value = DEFAULT_BRIDGE_ADDR)]
    bridge_addr: String,

    /// Where the current WA web version is published
    #[arg(long, env = "VERSION_URL", default_value = DEFAULT_VERSION_URL)]
    version_url: String,

    /// Start device pairing when no credentials are available
    #[arg(long, env = "ALLOW_PAIRING", default_value_t = false, value_parser = BoolishValueParser::new())]
    allow_pairing: bool,

    /// Reject incoming one-to-one calls
    #[arg(long, env = "REJECT_CALLS", default_value_t = false, value_parser = BoolishValueParser::new())]
    reject_calls: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "WABOT_LOG_JSON", default_value_t = false, value_parser = BoolishValueParser::new())]
    log_json: bool,
}

impl Args {
    fn bot_config(&self) -> BotConfig {
        let reactions = if self.reactions.is_empty() {
            DEFAULT_REACTIONS.iter().map(|s| s.to_string()).collect()
        } else {
            self.reactions.clone()
        };
        BotConfig {
            mode: self.mode,
            auto_react: self.auto_react,
            session_id: self.session_id.clone(),
            session_dir: self.session_dir.clone(),
            session_url_template: self.session_url_template.clone(),
            reactions,
            browser: DEFAULT_BROWSER.map(String::from),
            allow_pairing: self.allow_pairing,
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "wabot=info,wabot_core=info".into());
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_json);

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = args.bot_config().validate().context("invalid configuration")?;
    let started = chrono::Utc::now();
    let bot_name = config.browser[0].clone();

    tracing::info!(
        mode = %config.mode,
        auto_react = config.auto_react,
        session_dir = %config.session_dir.display(),
        bridge = %args.bridge_addr,
        "Starting {bot_name}"
    );

    let store = SessionStore::open(
        &config.session_dir,
        RemoteSource::new(config.session_url_template.clone()),
    )
    .await?;

    let engine = Arc::new(AutoReactionEngine::from_config(&config)?);
    let dispatcher = EventDispatcher::new(handlers::build(HandlerSettings {
        bot_name: bot_name.clone(),
        mode: config.mode,
        reject_calls: args.reject_calls,
        started,
    }))
    .with_message_subscriber(SUBSCRIBER_NAME, engine.into_handler());

    let backend = BridgeBackend::new(BridgeConfig {
        addr: args.bridge_addr.clone(),
        version_url: args.version_url.clone(),
    });
    let supervisor = ConnectionSupervisor::new(
        backend,
        store,
        Arc::new(config),
        dispatcher,
        ReconnectConfig::default(),
    );

    let health_state = Arc::new(HealthState {
        bot_name,
        started,
        status: supervisor.status(),
    });
    let port = args.port;
    tokio::spawn(async move {
        if let Err(e) = health::serve(port, health_state).await {
            tracing::error!(error = %e, "Health endpoint stopped");
        }
    });

    tokio::select! {
        exit = supervisor.run() => {
            tracing::info!(code = exit.exit_code(), "Supervisor finished: {exit:?}");
            Ok(ExitCode::from(exit.exit_code()))
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            Ok(ExitCode::SUCCESS)
        }
    }
}
