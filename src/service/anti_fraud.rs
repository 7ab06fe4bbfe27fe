// service/anti_fraud.rs
//
// Pure predicate functions for the anti-fraud rules. The duplicate-contact
// rule needs storage and lives with the attribution engine; everything here
// works on a policy snapshot and in-memory values only.
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::referralmodel::ReferredIdentity;
use crate::models::usermodel::UserProfile;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiFraudSettings {
    pub block_self_by_user: bool,
    pub block_self_by_contact: bool,
    pub block_duplicate_contact: bool,
}

impl Default for AntiFraudSettings {
    fn default() -> Self {
        Self {
            block_self_by_user: true,
            block_self_by_contact: true,
            block_duplicate_contact: true,
        }
    }
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("valid email regex")
    })
}

fn phone_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\+?\d[\d\s().\-]{5,}\d").expect("valid phone regex"))
}

pub fn normalize_email(email: &str) -> Option<String> {
    let trimmed = email.trim().to_lowercase();
    if email_regex().is_match(&trimmed) {
        Some(trimmed)
    } else {
        None
    }
}

/// Digits only; too-short fragments are rejected so stray numbers in a
/// free-text contact string don't masquerade as phone numbers.
pub fn normalize_phone(phone: &str) -> Option<String> {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 7 {
        Some(digits)
    } else {
        None
    }
}

/// Extracts identity tokens from a free-text contact string supplied by the
/// booking collaborator, e.g. "Jane Doe <jane@example.com> +1 555 010 0200".
pub fn parse_contact(contact: &str) -> ReferredIdentity {
    let email = email_regex()
        .find(contact)
        .and_then(|m| normalize_email(m.as_str()));

    // Strip the email before scanning for a phone so digits inside the
    // address can't match.
    let remainder = match email_regex().find(contact) {
        Some(m) => format!("{}{}", &contact[..m.start()], &contact[m.end()..]),
        None => contact.to_string(),
    };
    let phone = phone_regex()
        .find(&remainder)
        .and_then(|m| normalize_phone(m.as_str()));

    ReferredIdentity {
        user_id: None,
        email,
        phone,
    }
}

/// True when the candidate identity is the referrer themselves, under the
/// enabled policy flags.
pub fn is_self_referral(
    settings: &AntiFraudSettings,
    referrer: &UserProfile,
    identity: &ReferredIdentity,
) -> bool {
    if settings.block_self_by_user {
        if let Some(user_id) = identity.user_id {
            if user_id == referrer.id {
                return true;
            }
        }
    }

    if settings.block_self_by_contact {
        let referrer_email = referrer.email.as_deref().and_then(normalize_email);
        if let (Some(candidate), Some(own)) = (identity.email.as_deref(), referrer_email.as_deref())
        {
            if candidate == own {
                return true;
            }
        }

        let referrer_phone = referrer.phone.as_deref().and_then(normalize_phone);
        if let (Some(candidate), Some(own)) = (identity.phone.as_deref(), referrer_phone.as_deref())
        {
            if candidate == own {
                return true;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn referrer() -> UserProfile {
        UserProfile {
            id: Uuid::new_v4(),
            name: "Rita Referrer".to_string(),
            email: Some("Rita@Example.com".to_string()),
            phone: Some("+1 (555) 010-0200".to_string()),
        }
    }

    #[test]
    fn parse_contact_extracts_email_and_phone() {
        let identity = parse_contact("Jane Doe <jane.d+promo@example.co.uk> +1 555 010 0300");
        assert_eq!(identity.email.as_deref(), Some("jane.d+promo@example.co.uk"));
        assert_eq!(identity.phone.as_deref(), Some("15550100300"));
    }

    #[test]
    fn parse_contact_ignores_digits_inside_email() {
        let identity = parse_contact("user12345678@example.com");
        assert_eq!(identity.email.as_deref(), Some("user12345678@example.com"));
        assert_eq!(identity.phone, None);
    }

    #[test]
    fn parse_contact_handles_plain_text() {
        let identity = parse_contact("walk-in customer, no details");
        assert!(identity.is_empty());
    }

    #[test]
    fn normalize_phone_rejects_short_fragments() {
        assert_eq!(normalize_phone("suite 42"), None);
        assert_eq!(normalize_phone("0801 234 5678").as_deref(), Some("08012345678"));
    }

    #[test]
    fn self_referral_by_user_id() {
        let referrer = referrer();
        let settings = AntiFraudSettings::default();
        let identity = ReferredIdentity {
            user_id: Some(referrer.id),
            ..Default::default()
        };
        assert!(is_self_referral(&settings, &referrer, &identity));

        let relaxed = AntiFraudSettings {
            block_self_by_user: false,
            ..settings
        };
        assert!(!is_self_referral(&relaxed, &referrer, &identity));
    }

    #[test]
    fn self_referral_by_contact_is_case_insensitive() {
        let referrer = referrer();
        let settings = AntiFraudSettings::default();
        let identity = ReferredIdentity {
            email: Some("rita@example.com".to_string()),
            ..Default::default()
        };
        assert!(is_self_referral(&settings, &referrer, &identity));

        let by_phone = ReferredIdentity {
            phone: Some("15550100200".to_string()),
            ..Default::default()
        };
        assert!(is_self_referral(&settings, &referrer, &by_phone));

        let relaxed = AntiFraudSettings {
            block_self_by_contact: false,
            ..settings
        };
        assert!(!is_self_referral(&relaxed, &referrer, &identity));
    }

    #[test]
    fn different_contact_is_not_self() {
        let referrer = referrer();
        let settings = AntiFraudSettings::default();
        let identity = ReferredIdentity {
            email: Some("guest@example.com".to_string()),
            ..Default::default()
        };
        assert!(!is_self_referral(&settings, &referrer, &identity));
    }
}
