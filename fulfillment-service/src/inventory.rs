use std::time::Duration;

use chrono::{DateTime, Utc};
use common_observability::FulfillmentMetrics;
use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

/// Bounded attempts for the version-guarded capacity update before the
/// caller is told to back off.
pub const MAX_CAS_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("insufficient capacity for ticket type {ticket_type_id} (requested {requested}, available {available})")]
    InsufficientCapacity {
        ticket_type_id: Uuid,
        requested: i32,
        available: i32,
    },
    #[error("ticket type {0} not found")]
    UnknownTicketType(Uuid),
    #[error("capacity update contention for ticket type {0}")]
    Contention(Uuid),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// A provisional, capacity-backed hold taken at order-creation time.
/// Capacity is committed here; `finalize` is bookkeeping only.
#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    pub ticket_type_id: Uuid,
    pub quantity: i32,
    pub from_hold: bool,
}

/// A purchasable SKU with its own price and capacity.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TicketType {
    pub id: Uuid,
    pub edition_id: Uuid,
    pub name: String,
    pub price_minor: i64,
    pub currency: String,
    pub max_quantity: Option<i32>,
    pub sold_count: i32,
    pub waitlist_held: i32,
    pub is_active: bool,
    pub sales_start: Option<DateTime<Utc>>,
    pub sales_end: Option<DateTime<Utc>>,
}

const TICKET_TYPE_COLUMNS: &str = "id, edition_id, name, price_minor, currency, max_quantity, \
     sold_count, waitlist_held, is_active, sales_start, sales_end";

pub async fn get_ticket_type(
    db: &PgPool,
    ticket_type_id: Uuid,
) -> Result<Option<TicketType>, sqlx::Error> {
    sqlx::query_as::<_, TicketType>(&format!(
        "SELECT {TICKET_TYPE_COLUMNS} FROM ticket_types WHERE id = $1"
    ))
    .bind(ticket_type_id)
    .fetch_optional(db)
    .await
}

pub async fn list_ticket_types(
    db: &PgPool,
    edition_id: Uuid,
) -> Result<Vec<TicketType>, sqlx::Error> {
    sqlx::query_as::<_, TicketType>(&format!(
        "SELECT {TICKET_TYPE_COLUMNS} FROM ticket_types WHERE edition_id = $1 ORDER BY name"
    ))
    .bind(edition_id)
    .fetch_all(db)
    .await
}

#[derive(Debug, sqlx::FromRow)]
struct CapacityRow {
    max_quantity: Option<i32>,
    sold_count: i32,
    waitlist_held: i32,
    version: i64,
}

/// Units still purchasable by the general public. `None` means unlimited.
pub fn available_public(max_quantity: Option<i32>, sold_count: i32, waitlist_held: i32) -> Option<i32> {
    max_quantity.map(|max| (max - sold_count - waitlist_held).max(0))
}

async fn load_capacity(db: &PgPool, ticket_type_id: Uuid) -> Result<CapacityRow, InventoryError> {
    sqlx::query_as::<_, CapacityRow>(
        "SELECT max_quantity, sold_count, waitlist_held, version FROM ticket_types WHERE id = $1",
    )
    .bind(ticket_type_id)
    .fetch_optional(db)
    .await?
    .ok_or(InventoryError::UnknownTicketType(ticket_type_id))
}

async fn cas_counts(
    db: &PgPool,
    ticket_type_id: Uuid,
    sold_count: i32,
    waitlist_held: i32,
    expected_version: i64,
) -> Result<bool, InventoryError> {
    let updated = sqlx::query(
        "UPDATE ticket_types SET sold_count = $1, waitlist_held = $2, version = version + 1, updated_at = now() \
         WHERE id = $3 AND version = $4",
    )
    .bind(sold_count)
    .bind(waitlist_held)
    .bind(ticket_type_id)
    .bind(expected_version)
    .execute(db)
    .await?
    .rows_affected();
    Ok(updated == 1)
}

/// Reserve `quantity` units. The capacity check and the counter write are
/// made atomic by conditioning the write on the version read beforehand;
/// a concurrent writer bumps the version and forces a re-read. With
/// `from_hold` the units are claimed from the waitlist soft-hold pool
/// instead of the public one.
pub async fn reserve(
    db: &PgPool,
    metrics: &FulfillmentMetrics,
    ticket_type_id: Uuid,
    quantity: i32,
    from_hold: bool,
) -> Result<Reservation, InventoryError> {
    debug_assert!(quantity > 0);
    for attempt in 0..MAX_CAS_ATTEMPTS {
        let row = load_capacity(db, ticket_type_id).await?;

        if from_hold {
            if quantity > row.waitlist_held {
                metrics.capacity_rejections.inc();
                return Err(InventoryError::InsufficientCapacity {
                    ticket_type_id,
                    requested: quantity,
                    available: row.waitlist_held,
                });
            }
        } else if let Some(available) =
            available_public(row.max_quantity, row.sold_count, row.waitlist_held)
        {
            if quantity > available {
                metrics.capacity_rejections.inc();
                return Err(InventoryError::InsufficientCapacity {
                    ticket_type_id,
                    requested: quantity,
                    available,
                });
            }
        }

        let new_sold = row.sold_count + quantity;
        let new_held = if from_hold {
            row.waitlist_held - quantity
        } else {
            row.waitlist_held
        };
        if cas_counts(db, ticket_type_id, new_sold, new_held, row.version).await? {
            return Ok(Reservation { ticket_type_id, quantity, from_hold });
        }
        metrics.capacity_cas_conflicts.inc();
        tokio::time::sleep(Duration::from_millis(5 * (attempt as u64 + 1))).await;
    }
    tracing::warn!(ticket_type_id = %ticket_type_id, "Capacity CAS attempts exhausted");
    Err(InventoryError::Contention(ticket_type_id))
}

/// Release `quantity` previously reserved/sold units. `to_hold` of them
/// (0..=quantity) go into the waitlist soft-hold pool instead of the
/// public pool; that is how freed capacity stays reserved for notified
/// waitlist entries.
pub async fn release(
    db: &PgPool,
    metrics: &FulfillmentMetrics,
    ticket_type_id: Uuid,
    quantity: i32,
    to_hold: i32,
) -> Result<(), InventoryError> {
    debug_assert!(quantity > 0 && (0..=quantity).contains(&to_hold));
    for attempt in 0..MAX_CAS_ATTEMPTS {
        let row = load_capacity(db, ticket_type_id).await?;
        let new_sold = (row.sold_count - quantity).max(0);
        let new_held = row.waitlist_held + to_hold;
        if cas_counts(db, ticket_type_id, new_sold, new_held, row.version).await? {
            return Ok(());
        }
        metrics.capacity_cas_conflicts.inc();
        tokio::time::sleep(Duration::from_millis(5 * (attempt as u64 + 1))).await;
    }
    tracing::warn!(ticket_type_id = %ticket_type_id, "Capacity CAS attempts exhausted on release");
    Err(InventoryError::Contention(ticket_type_id))
}

/// Drain units from the soft-hold pool back to the public pool (a notified
/// entry expired and nobody below it is waiting).
pub async fn release_hold(
    db: &PgPool,
    metrics: &FulfillmentMetrics,
    ticket_type_id: Uuid,
    quantity: i32,
) -> Result<(), InventoryError> {
    for attempt in 0..MAX_CAS_ATTEMPTS {
        let row = load_capacity(db, ticket_type_id).await?;
        let new_held = (row.waitlist_held - quantity).max(0);
        if cas_counts(db, ticket_type_id, row.sold_count, new_held, row.version).await? {
            return Ok(());
        }
        metrics.capacity_cas_conflicts.inc();
        tokio::time::sleep(Duration::from_millis(5 * (attempt as u64 + 1))).await;
    }
    tracing::warn!(ticket_type_id = %ticket_type_id, "Capacity CAS attempts exhausted on hold release");
    Err(InventoryError::Contention(ticket_type_id))
}

/// Confirm a reservation on payment. Capacity was already committed at
/// reserve time, so there is nothing left to move.
pub fn finalize(reservation: &Reservation) {
    tracing::debug!(
        ticket_type_id = %reservation.ticket_type_id,
        quantity = reservation.quantity,
        "Reservation finalized"
    );
}
