//! Credential handling.
//!
//! Session management and OAuth providers live outside this crate; what remains here is what the
//! user repositories need to store credentials:
//!
//! - [`password`]: Argon2id password hashing/verification and SHA-256 API key digests

pub mod password;
