//! xfleet coordinator.
//!
//! Owns the authoritative diff log and node registry (via `xfleet-store`)
//! and serves the fleet over a JSON WebSocket protocol:
//! - [`hub`]: connected-session registry with a single-owner event loop
//!   and the heartbeat timeout monitor
//! - [`sync`]: the resumable pull protocol and push-side sync triggers
//! - [`server`]: axum surface: `/ws`, `/health`, `POST /api/token`

pub mod hub;
pub mod server;
pub mod sync;
