use chrono::{DateTime, Utc};
use common_observability::FulfillmentMetrics;
use rand::Rng;
use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::orders::OrderItem;

/// Ambiguous glyphs (0/O, 1/I) are excluded so door staff can read a code
/// out loud when the scanner fails.
const CODE_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 12;
const MAX_CODE_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketStatus {
    Valid,
    Used,
    Cancelled,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Valid => "valid",
            TicketStatus::Used => "used",
            TicketStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<TicketStatus> {
        match s {
            "valid" => Some(TicketStatus::Valid),
            "used" => Some(TicketStatus::Used),
            "cancelled" => Some(TicketStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Ticket {
    pub id: Uuid,
    pub order_item_id: Uuid,
    pub ticket_type_id: Uuid,
    pub seq: i32,
    pub code: String,
    pub status: String,
    pub qr_payload: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("could not allocate a unique ticket code after {MAX_CODE_RETRIES} attempts")]
    CodeExhausted,
    #[error("order item {order_item_id} has {actual} tickets, expected {expected}")]
    CountMismatch {
        order_item_id: Uuid,
        expected: i32,
        actual: i64,
    },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_CHARSET[rng.gen_range(0..CODE_CHARSET.len())] as char)
        .collect()
}

/// QR payload: provider-independent JSON an offline scanner can decode
/// without a network round trip.
pub fn qr_payload(ticket_id: Uuid, code: &str) -> String {
    serde_json::json!({ "ticket_id": ticket_id, "code": code }).to_string()
}

fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.constraint() == Some(constraint))
}

/// Mint exactly one ticket per unit of quantity. Each unit is keyed by
/// `(order_item_id, seq)`, so re-invocation (webhook retries, completion
/// retries) and concurrent invocation converge on the same ticket set
/// instead of minting duplicates.
pub async fn issue(
    db: &PgPool,
    metrics: &FulfillmentMetrics,
    item: &OrderItem,
) -> Result<Vec<Ticket>, TicketError> {
    for seq in 1..=item.quantity {
        let mut attempt = 0;
        loop {
            let ticket_id = Uuid::new_v4();
            let code = generate_code();
            let payload = qr_payload(ticket_id, &code);
            let result = sqlx::query(
                "INSERT INTO tickets (id, order_item_id, ticket_type_id, seq, code, status, qr_payload) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (order_item_id, seq) DO NOTHING",
            )
            .bind(ticket_id)
            .bind(item.id)
            .bind(item.ticket_type_id)
            .bind(seq)
            .bind(&code)
            .bind(TicketStatus::Valid.as_str())
            .bind(&payload)
            .execute(db)
            .await;
            match result {
                Ok(done) => {
                    if done.rows_affected() == 1 {
                        metrics.tickets_issued.inc();
                    }
                    break;
                }
                Err(err) if is_unique_violation(&err, "tickets_code_unique") => {
                    attempt += 1;
                    if attempt >= MAX_CODE_RETRIES {
                        return Err(TicketError::CodeExhausted);
                    }
                    tracing::warn!(order_item_id = %item.id, seq, "Ticket code collision, regenerating");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    let tickets = list_for_item(db, item.id).await?;
    if tickets.len() as i64 != item.quantity as i64 {
        return Err(TicketError::CountMismatch {
            order_item_id: item.id,
            expected: item.quantity,
            actual: tickets.len() as i64,
        });
    }
    Ok(tickets)
}

pub async fn list_for_item(db: &PgPool, order_item_id: Uuid) -> Result<Vec<Ticket>, sqlx::Error> {
    sqlx::query_as::<_, Ticket>(
        "SELECT id, order_item_id, ticket_type_id, seq, code, status, qr_payload, created_at \
         FROM tickets WHERE order_item_id = $1 ORDER BY seq",
    )
    .bind(order_item_id)
    .fetch_all(db)
    .await
}

pub async fn list_for_order(db: &PgPool, order_id: Uuid) -> Result<Vec<Ticket>, sqlx::Error> {
    sqlx::query_as::<_, Ticket>(
        "SELECT t.id, t.order_item_id, t.ticket_type_id, t.seq, t.code, t.status, t.qr_payload, t.created_at \
         FROM tickets t JOIN order_items oi ON oi.id = t.order_item_id \
         WHERE oi.order_id = $1 ORDER BY t.order_item_id, t.seq",
    )
    .bind(order_id)
    .fetch_all(db)
    .await
}

/// Invalidate every ticket on a refunded order. Idempotent: already
/// cancelled tickets are left alone.
pub async fn invalidate_for_order(db: &PgPool, order_id: Uuid) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(
        "UPDATE tickets SET status = $2 \
         WHERE status <> $2 AND order_item_id IN (SELECT id FROM order_items WHERE order_id = $1)",
    )
    .bind(order_id)
    .bind(TicketStatus::Cancelled.as_str())
    .execute(db)
    .await?;
    Ok(done.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_shape() {
        let code = generate_code();
        assert_eq!(code.len(), CODE_LEN);
        assert!(code.bytes().all(|b| CODE_CHARSET.contains(&b)));
    }

    #[test]
    fn codes_do_not_repeat_casually() {
        // 32^12 keyspace; two draws colliding would point at a broken RNG.
        assert_ne!(generate_code(), generate_code());
    }

    #[test]
    fn qr_payload_decodes_offline() {
        let id = Uuid::new_v4();
        let payload = qr_payload(id, "ABCD2345EFGH");
        let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed["ticket_id"], serde_json::json!(id));
        assert_eq!(parsed["code"], "ABCD2345EFGH");
    }
}
