use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::limits::KycTier;

/// Immutable link between a user's rail-side account and their brokerage
/// account. Both legs of a conversion are routed through it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualAccount {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Account identifier at the rail provider.
    pub rail_account_id: String,
    /// Account identifier at the brokerage.
    pub brokerage_account_id: String,
    pub created_at: DateTime<Utc>,
}

impl VirtualAccount {
    pub fn new(
        user_id: Uuid,
        rail_account_id: impl Into<String>,
        brokerage_account_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            rail_account_id: rail_account_id.into(),
            brokerage_account_id: brokerage_account_id.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    /// Raw status as reported by the KYC provider.
    pub kyc_status: String,
}

impl UserProfile {
    pub fn new(id: Uuid, kyc_status: impl Into<String>) -> Self {
        Self {
            id,
            kyc_status: kyc_status.into(),
        }
    }

    pub fn tier(&self) -> KycTier {
        KycTier::from_kyc_status(&self.kyc_status)
    }
}
