//! Lockstep
//!
//! A database-coordinated asynchronous job executor. Jobs live in one table
//! keyed by state; any number of nodes claim them with guarded updates, run
//! the registered handler and apply its effects in one transaction.

use shadow_rs::shadow;
shadow!(build);

pub mod cli;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod id;
pub mod jobs;
pub mod logger;
pub mod repositories;
pub mod schema;
pub mod services;

pub use engine::{JobEngine, JobEngineBuilder};

pub fn pkg_version() -> &'static str {
    build::PKG_VERSION
}

pub fn clap_long_version() -> &'static str {
    build::CLAP_LONG_VERSION
}
