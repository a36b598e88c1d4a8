//! install-guard - security core for a web-based application installer
//!
//! This crate provides:
//! - An access gate: one-time token, IP pinning, per-IP lockout, and an
//!   idle session timeout
//! - AES-256-GCM encrypted secret storage keyed by the application's APP_KEY
//! - Whitelisted, shell-free execution of installation commands
//! - A hash-chained audit log of security events
//! - An axum HTTP surface and a CLI over the same [`actions::Installer`]

pub mod actions;
pub mod cli;
pub mod concurrency;
pub mod config;
pub mod exec;
pub mod gate;
pub mod paths;
pub mod security;
pub mod server;

pub use config::Config;
