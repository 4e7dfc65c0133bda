//! mtuned - Autonomous MySQL/MariaDB Tuning Daemon
//!
//! A daemon that watches a running MySQL or MariaDB server together with the
//! host it lives on, and continuously adjusts a curated set of server
//! tunables. Every adjustment is applied at runtime with `SET GLOBAL`,
//! mirrored into an INI fragment so it survives a server restart, and
//! announced through a rate-limited notification channel.
//!
//! # Architecture
//!
//! A supervisor owns a set of independent periodic tuning loops, one per
//! tunable parameter. An I/O observer samples `iostat` and broadcasts the
//! inferred device speed to the tuners that need it. A single writer task
//! owns the persistent tune file; tuners only enqueue updates. Crashed
//! loops are restarted immediately; a shared cancellation token shuts
//! everything down.

pub mod config;
pub mod db;
pub mod error;
pub mod notify;
pub mod supervise;
pub mod tuner;
pub mod util;

pub use config::Config;
pub use error::{Error, Result};
