use chrono::{DateTime, Utc};
use common_money::Money;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscountType {
    Percentage,
    Fixed,
    Free,
}

impl DiscountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountType::Percentage => "percentage",
            DiscountType::Fixed => "fixed",
            DiscountType::Free => "free",
        }
    }

    pub fn parse(s: &str) -> Option<DiscountType> {
        match s {
            "percentage" => Some(DiscountType::Percentage),
            "fixed" => Some(DiscountType::Fixed),
            "free" => Some(DiscountType::Free),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PromoCode {
    pub id: Uuid,
    pub edition_id: Uuid,
    pub code: String,
    pub discount_type: String,
    pub value: i64,
    pub max_usage_count: Option<i32>,
    pub max_usage_per_person: Option<i32>,
    pub current_usage_count: i32,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub applicable_ticket_type_ids: Vec<Uuid>,
    pub is_active: bool,
}

/// A line item as seen by the validator: type, snapshotted unit price,
/// requested quantity.
#[derive(Debug, Clone, Copy)]
pub struct CandidateItem {
    pub ticket_type_id: Uuid,
    pub unit_price_minor: i64,
    pub quantity: i32,
}

/// Why a code was refused. Each reason maps to its own error code so the
/// rejection is never silent or generic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PromoRejection {
    #[error("promo code not recognised")]
    UnknownCode,
    #[error("promo code is not active")]
    Inactive,
    #[error("promo code is not valid yet")]
    NotStarted,
    #[error("promo code has expired")]
    Expired,
    #[error("promo code usage limit reached")]
    Exhausted,
    #[error("promo code already used the maximum number of times by this buyer")]
    PerPersonLimit,
    #[error("promo code does not apply to any item in this order")]
    NotApplicable,
    #[error("promo code has an unrecognised discount type")]
    BadDiscountType,
}

impl PromoRejection {
    pub fn code(&self) -> &'static str {
        match self {
            PromoRejection::UnknownCode => "promo_unknown",
            PromoRejection::Inactive => "promo_inactive",
            PromoRejection::NotStarted => "promo_not_started",
            PromoRejection::Expired => "promo_expired",
            PromoRejection::Exhausted => "promo_exhausted",
            PromoRejection::PerPersonLimit => "promo_per_person_limit",
            PromoRejection::NotApplicable => "promo_not_applicable",
            PromoRejection::BadDiscountType => "promo_invalid",
        }
    }
}

#[derive(Debug, Error)]
pub enum PromoError {
    #[error(transparent)]
    Rejected(#[from] PromoRejection),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

fn applies_to(promo: &PromoCode, ticket_type_id: Uuid) -> bool {
    promo.applicable_ticket_type_ids.is_empty()
        || promo.applicable_ticket_type_ids.contains(&ticket_type_id)
}

/// Evaluate a loaded code against candidate items. Checks run in a fixed
/// order and short-circuit on the first failure; the discount is clamped so
/// no item's effective price can go negative. Pure so the rule set is
/// testable without a database. Does not touch `current_usage_count`.
pub fn evaluate(
    promo: &PromoCode,
    items: &[CandidateItem],
    prior_uses_by_buyer: i64,
    now: DateTime<Utc>,
) -> Result<Money, PromoRejection> {
    if !promo.is_active {
        return Err(PromoRejection::Inactive);
    }
    if let Some(starts_at) = promo.starts_at {
        if now < starts_at {
            return Err(PromoRejection::NotStarted);
        }
    }
    if let Some(expires_at) = promo.expires_at {
        if now >= expires_at {
            return Err(PromoRejection::Expired);
        }
    }
    if let Some(max) = promo.max_usage_count {
        if promo.current_usage_count >= max {
            return Err(PromoRejection::Exhausted);
        }
    }
    if let Some(per_person) = promo.max_usage_per_person {
        if prior_uses_by_buyer >= per_person as i64 {
            return Err(PromoRejection::PerPersonLimit);
        }
    }
    let applicable: Vec<&CandidateItem> = items
        .iter()
        .filter(|item| applies_to(promo, item.ticket_type_id))
        .collect();
    if applicable.is_empty() {
        return Err(PromoRejection::NotApplicable);
    }

    let discount_type =
        DiscountType::parse(&promo.discount_type).ok_or(PromoRejection::BadDiscountType)?;

    let mut applicable_cents: i64 = 0;
    for item in &applicable {
        let line = item.unit_price_minor.saturating_mul(item.quantity as i64);
        applicable_cents = applicable_cents.saturating_add(line);
    }
    let applicable_total = Money::from_cents(applicable_cents);

    let discount = match discount_type {
        DiscountType::Percentage => applicable_total.apply_bps(promo.value.clamp(0, 100) * 100),
        DiscountType::Fixed => Money::from_cents(promo.value.max(0)).min(applicable_total),
        DiscountType::Free => applicable_total,
    };
    Ok(discount)
}

/// Load the code for an edition, count the buyer's prior paid orders that
/// used it, and evaluate. Returns the code row alongside the discount so
/// order completion can record the usage later.
pub async fn validate(
    db: &PgPool,
    code: &str,
    edition_id: Uuid,
    items: &[CandidateItem],
    buyer_email: &str,
    now: DateTime<Utc>,
) -> Result<(PromoCode, Money), PromoError> {
    let promo = sqlx::query_as::<_, PromoCode>(
        "SELECT id, edition_id, code, discount_type, value, max_usage_count, max_usage_per_person, \
                current_usage_count, starts_at, expires_at, applicable_ticket_type_ids, is_active \
         FROM promo_codes WHERE edition_id = $1 AND code = $2",
    )
    .bind(edition_id)
    .bind(code)
    .fetch_optional(db)
    .await?
    .ok_or(PromoRejection::UnknownCode)?;

    let prior_uses = if promo.max_usage_per_person.is_some() {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM orders WHERE promo_code_id = $1 AND buyer_email = $2 AND status = 'paid'",
        )
        .bind(promo.id)
        .bind(buyer_email)
        .fetch_one(db)
        .await?
    } else {
        0
    };

    let discount = evaluate(&promo, items, prior_uses, now)?;
    Ok((promo, discount))
}

/// Count one completed redemption. Conditional on the cap so concurrent
/// completions can never push the counter past it; returns whether the
/// increment landed.
pub async fn record_usage(db: &PgPool, promo_id: Uuid) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        "UPDATE promo_codes SET current_usage_count = current_usage_count + 1 \
         WHERE id = $1 AND (max_usage_count IS NULL OR current_usage_count < max_usage_count)",
    )
    .bind(promo_id)
    .execute(db)
    .await?
    .rows_affected();
    if updated == 0 {
        tracing::warn!(promo_id = %promo_id, "Promo usage increment skipped (cap reached)");
    }
    Ok(updated == 1)
}
