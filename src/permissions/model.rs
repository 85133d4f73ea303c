//! Lightweight, cache-serializable mirrors of the store's permission
//! models. Kept separate from `store::PermissionRank`/`PermissionAssignment`
//! so the cache layer never needs the store's richer types to round-trip
//! through JSON.

use crate::store::{PermissionAssignment, PermissionRank};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedRank {
    pub rank: i32,
}

impl From<&PermissionRank> for CachedRank {
    fn from(r: &PermissionRank) -> Self {
        Self { rank: r.rank }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedAssignment {
    pub rank: i32,
    pub role_id: i64,
}

impl From<&PermissionAssignment> for CachedAssignment {
    fn from(a: &PermissionAssignment) -> Self {
        Self {
            rank: a.rank,
            role_id: a.role_id,
        }
    }
}
