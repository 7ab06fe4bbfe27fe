// models/usermodel.rs
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Slim user record from the identity collaborator, enough for self-referral
/// checks and notification targeting.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserProfile {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}
