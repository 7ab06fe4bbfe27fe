// lib.rs
pub mod config;
pub mod db;
pub mod dtos;
pub mod models;
pub mod service;

use std::sync::Arc;

use crate::db::ReferralStore;
use crate::service::attribution_service::AttributionEngine;
use crate::service::code_registry::CodeRegistry;
use crate::service::notification_service::NotificationService;
use crate::service::program::ProgramConfigSource;
use crate::service::reward_ledger::RewardLedger;

/// Composition root for the referral program: wires the services over one
/// shared store and program-config source. The surrounding platform owns the
/// store (Postgres pool or in-memory) and the config source.
pub struct ReferralModule<S> {
    pub registry: CodeRegistry<S>,
    pub engine: AttributionEngine<S>,
    pub ledger: RewardLedger<S>,
    pub notifications: NotificationService<S>,
}

impl<S> Clone for ReferralModule<S> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            engine: self.engine.clone(),
            ledger: self.ledger.clone(),
            notifications: self.notifications.clone(),
        }
    }
}

impl<S: ReferralStore> ReferralModule<S> {
    pub fn new(store: Arc<S>, config: Arc<dyn ProgramConfigSource>, app_url: String) -> Self {
        let registry = CodeRegistry::new(store.clone(), app_url);
        let ledger = RewardLedger::new(store.clone());
        let notifications = NotificationService::new(store.clone());
        let engine = AttributionEngine::new(
            store,
            config,
            registry.clone(),
            ledger.clone(),
            notifications.clone(),
        );

        Self {
            registry,
            engine,
            ledger,
            notifications,
        }
    }
}
