//! Converse Agent Library Crate
//!
//! Session orchestration for a realtime voice agent: channel management,
//! the `Settings` handshake, idle detection and function-call handling.
//! The `agent` binary is a thin command-line wrapper around this library.

pub mod config;
pub mod session;
