//! Archival and redelivery pipeline for deleted chat messages.
//!
//! This crate is intentionally transport-agnostic. The remote chat service
//! (MTProto, Bot API, ...) and the UI live behind ports (traits) implemented
//! by adapter crates; the core only consumes an already-authenticated
//! [`client::RemoteClient`] handle.
//!
//! Pipeline: [`export::ExportCoordinator`] writes a durable manifest plus
//! content-addressed media on disk, [`batch::build_units`] groups the
//! manifest into delivery units, and [`deliver::RedeliveryEngine`] replays
//! them into a destination chat while remapping reply references. Every
//! remote call goes through the shared [`governor::RateGovernor`].

pub mod batch;
pub mod client;
pub mod config;
pub mod deliver;
pub mod domain;
pub mod errors;
pub mod export;
pub mod governor;
pub mod job;
pub mod logging;
pub mod manifest;
pub mod media;
pub mod render;

pub use errors::{Error, Result};
