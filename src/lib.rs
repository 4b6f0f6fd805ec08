//! Baker - a self-updating reverse proxy for containers
//!
//! This library provides a reverse proxy that:
//! - Discovers backend containers from Docker lifecycle events
//! - Polls each container for its own routing config (domain, path, rules, readiness)
//! - Keeps a concurrent domain → path → instance registry in sync with what it observes
//! - Dispatches requests to the matching backend, applying rewrite rules on the way
//! - Streams responses back with periodic flushing and trailer passthrough
//! - Supports automatic per-host TLS via ACME/Let's Encrypt

pub mod acme;
pub mod assembler;
pub mod config;
pub mod docker;
pub mod error;
pub mod loader;
pub mod model;
pub mod proxy;
pub mod registry;
pub mod rule;
pub mod trie;
pub mod upstream;
