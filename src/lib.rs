//! phantom-host - drive a long-lived interpreter process over a line protocol.

pub mod bridge;
pub mod config;
