//! Provisioning Domain (PvD) registry daemon.
//!
//! Module layout follows `examples/yaleman-goatns/src/lib.rs`'s shape (a flat
//! set of `pub mod` declarations plus a handful of crate-wide constants); the
//! DNS-specific wire types that used to live directly in this file
//! (`Header`/`Question`/`ResourceRecord`) have no counterpart in this domain
//! and are gone, replaced by the modules below.

pub mod bind;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod json;
pub mod kernel;
pub mod logging;
pub mod ra;
pub mod registry;
pub mod rtnetlink;
pub mod server;
pub mod wire;

/// Maximum size of a single wire message, matching `PVD_MAX_MSG_SIZE` in
/// `examples/original_source/include/pvd-defs.h`.
pub const MAX_MSG_SIZE: usize = 2048;
