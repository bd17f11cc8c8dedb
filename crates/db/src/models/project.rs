//! Project entity (read-only here).

use a6hub_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

pub const VISIBILITY_PUBLIC: &str = "public";
pub const VISIBILITY_PRIVATE: &str = "private";

/// A row from the `projects` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Project {
    pub id: DbId,
    pub owner_id: DbId,
    pub name: String,
    pub visibility: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Project {
    pub fn is_public(&self) -> bool {
        self.visibility == VISIBILITY_PUBLIC
    }
}
