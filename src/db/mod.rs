// db/mod.rs
pub mod db;
pub mod memorydb;
pub mod notificationdb;
pub mod referraldb;
pub mod rewarddb;
pub mod userdb;

pub use db::DBClient;
pub use memorydb::MemStore;

use thiserror::Error;

/// Errors at the persistence seam. Services translate these into their own
/// taxonomy; `Conflict` is how a backend reports a uniqueness violation
/// (e.g. a referral code collision) so callers can retry.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("conflict: {0}")]
    Conflict(String),
}

/// The full storage surface the referral services need. Implemented by
/// `DBClient` (Postgres) and `MemStore` (tests, local development).
pub trait ReferralStore:
    referraldb::ReferralExt
    + rewarddb::RewardLedgerExt
    + userdb::UserDirectoryExt
    + notificationdb::NotificationExt
    + Send
    + Sync
    + 'static
{
}

impl<T> ReferralStore for T where
    T: referraldb::ReferralExt
        + rewarddb::RewardLedgerExt
        + userdb::UserDirectoryExt
        + notificationdb::NotificationExt
        + Send
        + Sync
        + 'static
{
}
