//! Courier, a multi-account Telegram event relay.
//!
//! Keeps one protocol session per bot account, normalizes every inbound
//! message, enriches it with avatars and deduplicated media, and delivers it
//! to an HTTP ingestion backend through a bounded, retrying queue.
//!
//! See `DESIGN.md` for the architecture.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;
pub mod types;

pub mod protocol;
pub mod registry;

pub mod backend;
pub mod pipeline;

pub mod accounts;
pub mod admin;
pub mod supervisor;
