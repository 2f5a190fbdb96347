//! Leosac access-control hub kernel.
//!
//! One MAIN thread owns the configuration store and the module supervisor;
//! modules run on their own threads and reach the kernel through the
//! [`scheduler`] (blocking RPC onto MAIN) and the [`bus`] (publish/subscribe).
//! The [`remote`] service exposes authenticated administration and drives
//! [`replication`] between units.
//!
//! See `DESIGN.md` for full architecture documentation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bus;
pub mod config;
pub mod logging;
pub mod message;
pub mod scheduler;

pub mod kernel;
pub mod modules;

pub mod remote;
pub mod replication;
