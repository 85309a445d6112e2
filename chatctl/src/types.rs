//! Common type definitions shared across the crate.
//!
//! # ID Types
//!
//! User and group identifiers are plain strings. Users get a UUID v4 rendered as a string when they
//! are created; groups carry human-chosen ids, including the two built-in groups:
//!
//! - [`BUILTIN_USER_GROUP_ADMIN`]: administrators, never quota limited
//! - [`BUILTIN_USER_GROUP_DEFAULT`]: the group every new user lands in, never quota limited
//!
//! # Utility Functions
//!
//! - [`abbrev_id`]: Abbreviate ids to their first 8 chars for logging

use std::fmt;

pub type UserId = String;
pub type GroupId = String;

/// Id of the built-in admin group, seeded on first startup.
pub const BUILTIN_USER_GROUP_ADMIN: &str = "admin";

/// Id of the built-in default group, seeded on first startup.
pub const BUILTIN_USER_GROUP_DEFAULT: &str = "default";

/// Returns true for ids of the system-reserved groups.
pub fn is_builtin_group(id: &str) -> bool {
    id == BUILTIN_USER_GROUP_ADMIN || id == BUILTIN_USER_GROUP_DEFAULT
}

/// Abbreviate an id to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_id(id: &str) -> String {
    id.chars().take(8).collect()
}

// Operations that can be refused on protected entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Delete => write!(f, "Delete"),
        }
    }
}
