//! IRC bridge proxy for the JustAChat WebSocket gateway.
//!
//! Accepts plain IRC clients (optionally over TLS), speaks the gateway's
//! JSON event protocol upstream, and enforces per-IP admission quotas,
//! per-session message rates, and bans. A loopback admin API exposes
//! sessions, bans, and runtime rate thresholds.

pub mod admin;
pub mod backoff;
pub mod config;
pub mod error;
pub mod gateway;
pub mod irc;
pub mod listener;
pub mod ratelimit;
pub mod registry;
pub mod session;
pub mod tls;
