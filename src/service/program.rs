// service/program.rs
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ServiceError;
use crate::models::rewardmodels::RewardKind;
use crate::models::TenantScope;
use crate::service::anti_fraud::AntiFraudSettings;

pub const DEFAULT_EXPIRY_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardType {
    Wallet,
    PercentDiscount,
    FixedDiscount,
    FreeService,
}

/// Raw reward definition as the program configuration stores it. Resolution
/// validates the triplet into a `RewardKind`, one validator per kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardSpec {
    pub reward_type: RewardType,
    pub value: i64,
    pub service_id: Option<Uuid>,
}

impl RewardSpec {
    pub fn wallet(value: i64) -> Self {
        Self {
            reward_type: RewardType::Wallet,
            value,
            service_id: None,
        }
    }

    /// `Ok(None)` means the reward is configured off (non-positive value),
    /// which the ledger treats as a no-op rather than an error.
    pub fn resolve(&self) -> Result<Option<RewardKind>, ServiceError> {
        match self.reward_type {
            RewardType::Wallet => {
                if self.value <= 0 {
                    return Ok(None);
                }
                Ok(Some(RewardKind::WalletCredit { amount: self.value }))
            }
            RewardType::PercentDiscount => {
                if self.value <= 0 {
                    return Ok(None);
                }
                Ok(Some(RewardKind::PercentDiscount {
                    percent: self.value.min(100),
                }))
            }
            RewardType::FixedDiscount => {
                if self.value <= 0 {
                    return Ok(None);
                }
                Ok(Some(RewardKind::FixedDiscount { amount: self.value }))
            }
            RewardType::FreeService => {
                let service_id = self.service_id.ok_or(ServiceError::MissingService)?;
                Ok(Some(RewardKind::FreeService { service_id }))
            }
        }
    }
}

/// Snapshot of the program parameters for one tenant scope. Storage of this
/// configuration belongs to the surrounding platform; the engine only ever
/// sees a snapshot per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferralProgramConfig {
    pub enabled: bool,
    pub attribution_expiry_days: i64,
    pub new_customer_only: bool,
    /// 0 means unlimited.
    pub monthly_max_rewards_per_referrer: i64,
    /// Empty means every service qualifies.
    pub allowed_service_ids: Vec<Uuid>,
    pub reward_referrer: Option<RewardSpec>,
    pub reward_referred: Option<RewardSpec>,
    pub anti_fraud: AntiFraudSettings,
}

impl Default for ReferralProgramConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            attribution_expiry_days: DEFAULT_EXPIRY_DAYS,
            new_customer_only: false,
            monthly_max_rewards_per_referrer: 0,
            allowed_service_ids: Vec::new(),
            reward_referrer: None,
            reward_referred: None,
            anti_fraud: AntiFraudSettings::default(),
        }
    }
}

impl ReferralProgramConfig {
    pub fn service_allowed(&self, service_id: Option<Uuid>) -> bool {
        if self.allowed_service_ids.is_empty() {
            return true;
        }
        match service_id {
            Some(id) => self.allowed_service_ids.contains(&id),
            None => false,
        }
    }
}

#[async_trait]
pub trait ProgramConfigSource: Send + Sync {
    async fn get_config(&self, scope: TenantScope) -> Result<ReferralProgramConfig, ServiceError>;

    async fn is_module_enabled(&self, scope: TenantScope) -> Result<bool, ServiceError> {
        Ok(self.get_config(scope).await?.enabled)
    }
}

/// Fixed configuration for every scope. Tests and single-tenant deployments
/// use this; the platform wires its own source in production.
#[derive(Debug, Clone)]
pub struct StaticProgramSource {
    config: ReferralProgramConfig,
}

impl StaticProgramSource {
    pub fn new(config: ReferralProgramConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ProgramConfigSource for StaticProgramSource {
    async fn get_config(&self, _scope: TenantScope) -> Result<ReferralProgramConfig, ServiceError> {
        Ok(self.config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wallet_spec_with_zero_value_resolves_to_none() {
        let spec = RewardSpec::wallet(0);
        assert!(spec.resolve().unwrap().is_none());
    }

    #[test]
    fn percent_spec_is_capped_at_100() {
        let spec = RewardSpec {
            reward_type: RewardType::PercentDiscount,
            value: 250,
            service_id: None,
        };
        assert_eq!(
            spec.resolve().unwrap(),
            Some(RewardKind::PercentDiscount { percent: 100 })
        );
    }

    #[test]
    fn free_service_spec_requires_service_id() {
        let spec = RewardSpec {
            reward_type: RewardType::FreeService,
            value: 0,
            service_id: None,
        };
        assert!(matches!(spec.resolve(), Err(ServiceError::MissingService)));
    }

    #[test]
    fn empty_allow_list_allows_everything() {
        let config = ReferralProgramConfig::default();
        assert!(config.service_allowed(None));
        assert!(config.service_allowed(Some(Uuid::new_v4())));

        let restricted = ReferralProgramConfig {
            allowed_service_ids: vec![Uuid::new_v4()],
            ..config
        };
        assert!(!restricted.service_allowed(None));
        assert!(!restricted.service_allowed(Some(Uuid::new_v4())));
        assert!(restricted.service_allowed(Some(restricted.allowed_service_ids[0])));
    }
}
