// models/mod.rs
pub mod referralmodel;
pub mod rewardmodels;
pub mod usermodel;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Every entity in this crate is partitioned by (brand, location). The scope
/// is threaded explicitly through every call instead of living in ambient
/// request state, so the services stay deterministic and testable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantScope {
    pub tenant_id: Uuid,
    pub location_id: Uuid,
}

impl TenantScope {
    pub fn new(tenant_id: Uuid, location_id: Uuid) -> Self {
        Self {
            tenant_id,
            location_id,
        }
    }
}
