//! Repository layer for the relational store.
//!
//! Every state change that touches more than one row (a campaign claim, an
//! outcome batch, attachment locking) runs inside a single transaction.

pub mod activity_tx;
pub mod campaign;
pub mod queue;
pub mod send_configuration;

pub use activity_tx::*;
pub use campaign::*;
pub use queue::*;
pub use send_configuration::*;

use sqlx::{QueryBuilder, Sqlite};

/// Append ` AND <column> NOT IN (..)` to a query when `ids` is non-empty.
pub(crate) fn push_not_in(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, ids: &[i64]) {
    if ids.is_empty() {
        return;
    }
    qb.push(" AND ");
    qb.push(column);
    qb.push(" NOT IN (");
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}
