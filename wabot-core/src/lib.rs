//! Connection supervisor and event dispatch core for a WhatsApp Web bot.
//!
//! [`supervisor::ConnectionSupervisor`] keeps a single authenticated
//! session alive through a pluggable [`backend::Backend`], persists rotating
//! credentials via [`session::SessionStore`], and hands inbound traffic to
//! failure-isolated handlers through [`dispatch::EventDispatcher`].

pub mod autoreact;
pub mod backend;
pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod session;
pub mod state;
pub mod supervisor;

pub use backend::{Backend, ConnectionHandle};
pub use config::{BotConfig, Mode};
pub use dispatch::{EventDispatcher, Handlers, handler};
pub use supervisor::{ConnectionSupervisor, ReconnectConfig, SupervisorExit, SupervisorStatus};
