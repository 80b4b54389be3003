//! wabot: a WhatsApp Web bot built on `wabot-core`.
//!
//! The binary wires configuration, logging and a liveness endpoint around
//! the core supervisor; the handlers here are the bot's own behaviour.

pub mod handlers;
pub mod health;
