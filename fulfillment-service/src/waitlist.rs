use chrono::{DateTime, Duration, Utc};
use common_observability::FulfillmentMetrics;
use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::inventory::{self, available_public, InventoryError};
use crate::notify::{NotificationKind, NotifyHandle};

const MAX_POSITION_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitlistStatus {
    Waiting,
    Notified,
    Purchased,
    Expired,
    Cancelled,
}

impl WaitlistStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitlistStatus::Waiting => "waiting",
            WaitlistStatus::Notified => "notified",
            WaitlistStatus::Purchased => "purchased",
            WaitlistStatus::Expired => "expired",
            WaitlistStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<WaitlistStatus> {
        match s {
            "waiting" => Some(WaitlistStatus::Waiting),
            "notified" => Some(WaitlistStatus::Notified),
            "purchased" => Some(WaitlistStatus::Purchased),
            "expired" => Some(WaitlistStatus::Expired),
            "cancelled" => Some(WaitlistStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WaitlistEntry {
    pub id: Uuid,
    pub edition_id: Uuid,
    pub ticket_type_id: Uuid,
    pub buyer_email: String,
    pub buyer_name: String,
    pub status: String,
    #[serde(rename = "position")]
    pub queue_position: i64,
    pub notified_at: Option<DateTime<Utc>>,
    pub purchase_window_end: Option<DateTime<Utc>>,
    pub order_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum WaitlistError {
    #[error("ticket type {0} still has public capacity")]
    NotSoldOut(Uuid),
    #[error("a waiting entry already exists for this buyer")]
    AlreadyWaiting,
    #[error("waitlist entry {0} not found")]
    NotFound(Uuid),
    #[error("waitlist entry {0} is not in a convertible state")]
    NotConvertible(Uuid),
    #[error("could not allocate a queue position for ticket type {0}")]
    PositionContention(Uuid),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

const ENTRY_COLUMNS: &str = "id, edition_id, ticket_type_id, buyer_email, buyer_name, status, \
     queue_position, notified_at, purchase_window_end, order_id, created_at, updated_at";

pub async fn get_entry(db: &PgPool, entry_id: Uuid) -> Result<Option<WaitlistEntry>, sqlx::Error> {
    sqlx::query_as::<_, WaitlistEntry>(&format!(
        "SELECT {ENTRY_COLUMNS} FROM waitlist_entries WHERE id = $1"
    ))
    .bind(entry_id)
    .fetch_optional(db)
    .await
}

fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.constraint() == Some(constraint))
}

/// Join the queue for a sold-out ticket type. The position is the current
/// maximum plus one; the unique `(ticket_type_id, queue_position)` index is
/// the optimistic guard — a concurrent join taking the same slot forces a
/// re-read, same discipline as the inventory ledger.
pub async fn join(
    db: &PgPool,
    edition_id: Uuid,
    ticket_type_id: Uuid,
    buyer_email: &str,
    buyer_name: &str,
) -> Result<WaitlistEntry, WaitlistError> {
    let ticket_type = inventory::get_ticket_type(db, ticket_type_id)
        .await?
        .ok_or(InventoryError::UnknownTicketType(ticket_type_id))?;
    match available_public(
        ticket_type.max_quantity,
        ticket_type.sold_count,
        ticket_type.waitlist_held,
    ) {
        Some(0) => {}
        _ => return Err(WaitlistError::NotSoldOut(ticket_type_id)),
    }

    let open_entry = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM waitlist_entries \
         WHERE ticket_type_id = $1 AND buyer_email = $2 AND status IN ('waiting', 'notified')",
    )
    .bind(ticket_type_id)
    .bind(buyer_email)
    .fetch_one(db)
    .await?;
    if open_entry > 0 {
        return Err(WaitlistError::AlreadyWaiting);
    }

    for _ in 0..MAX_POSITION_ATTEMPTS {
        let next_position = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(queue_position), 0) + 1 FROM waitlist_entries WHERE ticket_type_id = $1",
        )
        .bind(ticket_type_id)
        .fetch_one(db)
        .await?;

        let entry_id = Uuid::new_v4();
        let inserted = sqlx::query(
            "INSERT INTO waitlist_entries \
             (id, edition_id, ticket_type_id, buyer_email, buyer_name, status, queue_position) \
             VALUES ($1, $2, $3, $4, $5, 'waiting', $6)",
        )
        .bind(entry_id)
        .bind(edition_id)
        .bind(ticket_type_id)
        .bind(buyer_email)
        .bind(buyer_name)
        .bind(next_position)
        .execute(db)
        .await;

        match inserted {
            Ok(_) => {
                tracing::info!(
                    entry_id = %entry_id,
                    ticket_type_id = %ticket_type_id,
                    position = next_position,
                    "Waitlist entry created"
                );
                return get_entry(db, entry_id)
                    .await?
                    .ok_or(WaitlistError::NotFound(entry_id));
            }
            Err(err) if is_unique_violation(&err, "waitlist_fifo_slot") => {
                // Lost the slot to a concurrent join; re-read and retry.
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(WaitlistError::PositionContention(ticket_type_id))
}

/// Offer `freed` units to the queue: the lowest-position `waiting` entries
/// are flipped to `notified` with a purchase window. Returns how many were
/// promoted — the caller moves exactly that many units into the soft-hold
/// pool. Entries are only ever selected in position order.
pub async fn promote_next(
    db: &PgPool,
    metrics: &FulfillmentMetrics,
    notify: &NotifyHandle,
    ticket_type_id: Uuid,
    freed: i32,
    purchase_window: Duration,
) -> Result<i32, WaitlistError> {
    if freed <= 0 {
        return Ok(0);
    }
    let candidates = sqlx::query_as::<_, WaitlistEntry>(&format!(
        "SELECT {ENTRY_COLUMNS} FROM waitlist_entries \
         WHERE ticket_type_id = $1 AND status = 'waiting' \
         ORDER BY queue_position ASC LIMIT $2"
    ))
    .bind(ticket_type_id)
    .bind(freed as i64)
    .fetch_all(db)
    .await?;

    let mut promoted = 0;
    for entry in candidates {
        let now = Utc::now();
        let window_end = now + purchase_window;
        let updated = sqlx::query(
            "UPDATE waitlist_entries \
             SET status = 'notified', notified_at = $2, purchase_window_end = $3, updated_at = now() \
             WHERE id = $1 AND status = 'waiting'",
        )
        .bind(entry.id)
        .bind(now)
        .bind(window_end)
        .execute(db)
        .await?
        .rows_affected();
        if updated == 1 {
            promoted += 1;
            metrics.waitlist_promotions.inc();
            notify.fire(NotificationKind::WaitlistPromoted, entry.id);
            tracing::info!(
                entry_id = %entry.id,
                ticket_type_id = %ticket_type_id,
                position = entry.queue_position,
                "Waitlist entry promoted"
            );
        }
    }
    Ok(promoted)
}

/// Bridge into order creation: a notified entry becomes `purchased` and is
/// linked to the order that claimed its held unit.
pub async fn convert(db: &PgPool, entry_id: Uuid, order_id: Uuid) -> Result<(), WaitlistError> {
    let updated = sqlx::query(
        "UPDATE waitlist_entries SET status = 'purchased', order_id = $2, updated_at = now() \
         WHERE id = $1 AND status = 'notified'",
    )
    .bind(entry_id)
    .bind(order_id)
    .execute(db)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(WaitlistError::NotConvertible(entry_id));
    }
    Ok(())
}

/// Expire notified entries whose purchase window has lapsed and hand their
/// held unit to the next waiting entry (or back to the public pool when the
/// queue behind them is empty). Entries below the expired one are never
/// skipped or reordered.
pub async fn expire_stale(
    db: &PgPool,
    metrics: &FulfillmentMetrics,
    notify: &NotifyHandle,
    purchase_window: Duration,
    now: DateTime<Utc>,
) -> Result<u32, WaitlistError> {
    let stale = sqlx::query_as::<_, WaitlistEntry>(&format!(
        "SELECT {ENTRY_COLUMNS} FROM waitlist_entries \
         WHERE status = 'notified' AND purchase_window_end IS NOT NULL AND purchase_window_end < $1 \
         ORDER BY queue_position ASC"
    ))
    .bind(now)
    .fetch_all(db)
    .await?;

    let mut expired = 0;
    for entry in stale {
        let updated = sqlx::query(
            "UPDATE waitlist_entries SET status = 'expired', updated_at = now() \
             WHERE id = $1 AND status = 'notified'",
        )
        .bind(entry.id)
        .execute(db)
        .await?
        .rows_affected();
        if updated != 1 {
            // Converted in the meantime; the hold was claimed normally.
            continue;
        }
        expired += 1;
        metrics.waitlist_expirations.inc();
        tracing::info!(
            entry_id = %entry.id,
            ticket_type_id = %entry.ticket_type_id,
            position = entry.queue_position,
            "Waitlist entry expired"
        );

        let handed_on = promote_next(
            db,
            metrics,
            notify,
            entry.ticket_type_id,
            1,
            purchase_window,
        )
        .await?;
        if handed_on == 0 {
            // Nobody left behind this entry: the held unit goes public.
            inventory::release_hold(db, metrics, entry.ticket_type_id, 1).await?;
        }
    }
    Ok(expired)
}

/// A buyer backing out of the queue. Freed positions are not reused; FIFO
/// order of the remaining entries is untouched.
pub async fn cancel_entry(db: &PgPool, entry_id: Uuid) -> Result<WaitlistEntry, WaitlistError> {
    let updated = sqlx::query(
        "UPDATE waitlist_entries SET status = 'cancelled', updated_at = now() \
         WHERE id = $1 AND status = 'waiting'",
    )
    .bind(entry_id)
    .execute(db)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(WaitlistError::NotConvertible(entry_id));
    }
    get_entry(db, entry_id)
        .await?
        .ok_or(WaitlistError::NotFound(entry_id))
}
