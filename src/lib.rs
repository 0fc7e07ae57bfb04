//! Web Page Replay: a deterministic record/replay HTTP(S) proxy.
//!
//! See `SPEC_FULL.md` for the full component breakdown; module layout
//! mirrors it one-to-one.

pub mod archive;
pub mod config;
pub mod error;
pub mod fetch;
pub mod mutator;
pub mod request;
pub mod rules;
pub mod server;
pub mod shaping;
pub mod tls;
pub mod writer;

pub use config::WprConfig;
pub use error::{Result, WprError};
