//! UUID utilities

use crate::{Error, Result};
use uuid::Uuid;

/// Generate a new UUIDv4
pub fn generate() -> Uuid {
    Uuid::new_v4()
}

/// Parse a UUID stored as text, mapping failures to a common error
pub fn parse(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|_| Error::InvalidValue(format!("UUID '{}'", s)))
}

/// Parse an optional UUID column
pub fn parse_opt(s: Option<&str>) -> Result<Option<Uuid>> {
    s.map(parse).transpose()
}
