//! # allocsync-id
//!
//! Identifier types shared by the allocation watcher crates.
//!
//! ## Design Principles
//!
//! - IDs are assigned by the cluster scheduler; this crate never interprets them
//! - All IDs have a canonical string representation with strict parsing
//! - IDs are typed so a node ID cannot be passed where an allocation ID is expected
//!
//! ## ID Format
//!
//! The scheduler issues UUIDs, but the watcher treats every ID as an opaque
//! token: any non-empty string of printable, non-whitespace characters up to
//! [`MAX_ID_LEN`] bytes is accepted.
//!
//! Examples:
//! - `5456bd7a-9fc0-c0dd-6131-cbee77f57577`
//! - `node-a`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Maximum accepted length of an ID, in bytes.
pub const MAX_ID_LEN: usize = 128;

#[doc(hidden)]
pub use uuid::Uuid;

/// Validate a raw ID string.
///
/// Shared by every type generated with [`define_id!`].
pub fn validate(s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }

    if s.len() > MAX_ID_LEN {
        return Err(IdError::TooLong {
            max: MAX_ID_LEN,
            actual: s.len(),
        });
    }

    if let Some((position, ch)) = s
        .char_indices()
        .find(|(_, c)| c.is_whitespace() || c.is_control())
    {
        return Err(IdError::InvalidCharacter { ch, position });
    }

    Ok(())
}
