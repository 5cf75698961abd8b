// crates/backend-lib/src/middleware/mod.rs

//! Middleware for the `CrowdPulse` WebSocket server.

pub mod rate_limit;

pub use rate_limit::{client_ip, rate_limit, ClientIp};
