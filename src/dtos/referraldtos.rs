// dtos/referraldtos.rs
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::referralmodel::{Attribution, AttributionStatus};

/// Request to attribute a prospective customer to a referrer's code.
/// At least one of `referred_user_id` / `referred_email` / `referred_phone` /
/// `contact` must carry an identity; the engine enforces that after
/// normalization since free-text `contact` can only be judged post-parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct AttributeReferralDto {
    #[validate(length(min = 1, message = "Referral code is required"))]
    pub code: String,

    pub referred_user_id: Option<Uuid>,

    #[validate(email(message = "Invalid email"))]
    pub referred_email: Option<String>,

    pub referred_phone: Option<String>,

    /// Free-text contact string, e.g. "Jane <jane@example.com> +1 555 010 0200".
    pub contact: Option<String>,

    pub metadata: Option<serde_json::Value>,
}

/// Booking event payload for attaching an attribution to an appointment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct AttachBookingDto {
    pub appointment_id: Uuid,

    /// Explicit attribution id wins over identity matching when present.
    pub attribution_id: Option<Uuid>,

    pub customer_user_id: Option<Uuid>,

    #[validate(email(message = "Invalid email"))]
    pub customer_email: Option<String>,

    pub customer_phone: Option<String>,
}

/// Completion event payload. `amount` is the booking total in minor units.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BookingCompletionDto {
    pub appointment_id: Uuid,

    pub service_id: Option<Uuid>,

    #[validate(range(min = 0, message = "Amount cannot be negative"))]
    pub amount: i64,
}

/// Row shape for referrer-facing listings. Contact tokens of the referred
/// person are deliberately left out.
#[derive(Debug, Serialize, Deserialize)]
pub struct AttributionResponseDto {
    pub id: Uuid,
    pub code_id: Uuid,
    pub referrer_user_id: Uuid,
    pub status: AttributionStatus,
    pub attributed_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub first_appointment_id: Option<Uuid>,
    pub void_reason: Option<String>,
}

impl From<&Attribution> for AttributionResponseDto {
    fn from(attribution: &Attribution) -> Self {
        Self {
            id: attribution.id,
            code_id: attribution.code_id,
            referrer_user_id: attribution.referrer_user_id,
            status: attribution.status,
            attributed_at: attribution.attributed_at,
            expires_at: attribution.expires_at,
            first_appointment_id: attribution.first_appointment_id,
            void_reason: attribution.void_reason().map(str::to_string),
        }
    }
}
