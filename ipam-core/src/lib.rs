//! # ipam-core
//!
//! Process level configuration for `hostipam`: command line & env parsing,
//! tracing setup, and re-exports of the crates a binary needs to drive an
//! address manager.
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
pub use address_manager;
pub use anyhow;
pub use ::config as source_config;
pub use platform;
pub use tokio;
pub use tracing;

pub mod config;
pub mod env;
