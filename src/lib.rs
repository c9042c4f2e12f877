//! Chunked Upload Server Library
//!
//! Accepts large files as independently uploaded chunks and reassembles
//! them server-side. The binary in main.rs only wires configuration,
//! logging and the HTTP listener around these modules.
//!
//! # Modules
//!
//! - `upload`: chunk staging, per-upload locking and ordered merging
//! - `routes`: HTTP endpoints over the upload core
//! - `config`: environment-driven configuration
//! - `state`: shared application state

pub mod config;
pub mod routes;
pub mod state;
pub mod upload;
