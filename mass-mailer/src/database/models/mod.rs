//! Relational store models.

pub mod activity;
pub mod campaign;
pub mod message;
pub mod send_configuration;

pub use activity::*;
pub use campaign::*;
pub use message::*;
pub use send_configuration::*;

/// Parse a JSON array of ids stored in a TEXT column.
pub(crate) fn parse_id_list(raw: &str) -> crate::Result<Vec<i64>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(raw)?)
}
