//! Node-identity tokens for the xfleet control plane.
//!
//! This crate provides:
//! - HMAC-SHA256 JWT minting for slave nodes
//! - Validation that distinguishes expired from otherwise invalid tokens
//! - Refresh (re-issue) for tokens that are valid or merely expired
//!
//! A token identifies exactly one node; there is no further authorization
//! model behind it.

mod token;

pub use token::{Claims, TokenAuthority, TokenError, TokenResult};
