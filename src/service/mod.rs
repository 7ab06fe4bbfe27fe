// service/mod.rs
pub mod anti_fraud;
pub mod attribution_service;
pub mod code_registry;
pub mod error;
pub mod notification_service;
pub mod program;
pub mod reward_ledger;
