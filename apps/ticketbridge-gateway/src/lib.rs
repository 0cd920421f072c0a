//! MCP gateway in front of the NSP ticketing API.
//!
//! The binary in `main.rs` parses configuration and runs [`app::router`]; the
//! pieces are exposed here so integration tests can drive them in-process.

pub mod app;
pub mod config;
pub mod nsp;
pub mod stdio;
pub mod tools;
