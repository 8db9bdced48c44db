//! Call-Center Relay Library Crate
//!
//! All runtime logic for the relay services: the engine link, the telephony
//! media router, the avatar forwarder, the offline lip-sync compositor and the
//! orchestration API. The binaries under `bin/` are thin wrappers around it.

pub mod audio_utils;
pub mod avatar;
pub mod config;
pub mod conversation_client;
pub mod engine;
pub mod handlers;
pub mod lipsync;
pub mod models;
pub mod router;
pub mod state;
pub mod telephony;
