use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use common_money::Money;
use common_observability::FulfillmentMetrics;
use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::inventory::{self, InventoryError, Reservation};
use crate::notify::{NotificationKind, NotifyHandle};
use crate::promo::{self, CandidateItem, PromoError};
use crate::tickets::{self, Ticket, TicketError};
use crate::waitlist::{self, WaitlistError, WaitlistStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<OrderStatus> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "paid" => Some(OrderStatus::Paid),
            "cancelled" => Some(OrderStatus::Cancelled),
            "refunded" => Some(OrderStatus::Refunded),
            _ => None,
        }
    }
}

/// Valid transitions:
/// pending -> paid | cancelled
/// paid -> refunded
/// Everything else is rejected; callers driven by retried webhooks treat
/// the rejection as a no-op, user-initiated callers surface HTTP 409.
pub fn is_valid_transition(from: OrderStatus, to: OrderStatus) -> bool {
    match from {
        OrderStatus::Pending => matches!(to, OrderStatus::Paid | OrderStatus::Cancelled),
        OrderStatus::Paid => matches!(to, OrderStatus::Refunded),
        // Terminal states never transition again
        OrderStatus::Cancelled | OrderStatus::Refunded => false,
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Order {
    pub id: Uuid,
    pub edition_id: Uuid,
    pub buyer_email: String,
    pub buyer_name: String,
    pub status: String,
    pub currency: String,
    pub total_minor: i64,
    pub discount_minor: i64,
    pub promo_code_id: Option<Uuid>,
    pub provider: Option<String>,
    pub provider_session_id: Option<String>,
    pub payment_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub ticket_type_id: Uuid,
    pub quantity: i32,
    pub unit_price_minor: i64,
    #[serde(skip)]
    pub released: bool,
}

#[derive(Debug, Clone)]
pub struct NewOrderItem {
    pub ticket_type_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub edition_id: Uuid,
    pub buyer_email: String,
    pub buyer_name: String,
    pub items: Vec<NewOrderItem>,
    pub promo_code: Option<String>,
    pub waitlist_entry_id: Option<Uuid>,
}

#[derive(Debug)]
pub struct CreatedOrder {
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub tickets: Vec<Ticket>,
    pub completed: bool,
}

#[derive(Debug)]
pub struct CompletionOutcome {
    pub order: Order,
    pub tickets: Vec<Ticket>,
    pub already_paid: bool,
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("order {0} not found")]
    NotFound(Uuid),
    #[error("order cannot go from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Promo(#[from] PromoError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Ticket(#[from] TicketError),
    #[error(transparent)]
    Waitlist(#[from] WaitlistError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

const ORDER_COLUMNS: &str = "id, edition_id, buyer_email, buyer_name, status, currency, \
     total_minor, discount_minor, promo_code_id, provider, provider_session_id, \
     payment_reference, created_at, updated_at";

pub async fn get_order(db: &PgPool, order_id: Uuid) -> Result<Order, OrderError> {
    sqlx::query_as::<_, Order>(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
        .bind(order_id)
        .fetch_optional(db)
        .await?
        .ok_or(OrderError::NotFound(order_id))
}

pub async fn find_by_session(
    db: &PgPool,
    provider: &str,
    session_id: &str,
) -> Result<Option<Order>, sqlx::Error> {
    sqlx::query_as::<_, Order>(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders WHERE provider = $1 AND provider_session_id = $2"
    ))
    .bind(provider)
    .bind(session_id)
    .fetch_optional(db)
    .await
}

pub async fn list_items(db: &PgPool, order_id: Uuid) -> Result<Vec<OrderItem>, sqlx::Error> {
    sqlx::query_as::<_, OrderItem>(
        "SELECT id, order_id, ticket_type_id, quantity, unit_price_minor, released \
         FROM order_items WHERE order_id = $1",
    )
    .bind(order_id)
    .fetch_all(db)
    .await
}

pub async fn set_provider_session(
    db: &PgPool,
    order_id: Uuid,
    provider: &str,
    session_id: &str,
) -> Result<(), OrderError> {
    let updated = sqlx::query(
        "UPDATE orders SET provider = $2, provider_session_id = $3, updated_at = now() WHERE id = $1",
    )
    .bind(order_id)
    .bind(provider)
    .bind(session_id)
    .execute(db)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(OrderError::NotFound(order_id));
    }
    Ok(())
}

async fn release_reservations(
    db: &PgPool,
    metrics: &FulfillmentMetrics,
    reservations: &[Reservation],
) {
    for r in reservations {
        let to_hold = if r.from_hold { r.quantity } else { 0 };
        if let Err(err) = inventory::release(db, metrics, r.ticket_type_id, r.quantity, to_hold).await
        {
            tracing::error!(
                error = %err,
                ticket_type_id = %r.ticket_type_id,
                "Failed to roll back reservation"
            );
        }
    }
}

/// Create a pending order: validate the requested types, reserve capacity
/// all-or-nothing, apply the promo code, persist with snapshotted unit
/// prices. A zero total completes immediately without a provider round-trip.
pub async fn create_order(
    db: &PgPool,
    metrics: &FulfillmentMetrics,
    notify: &NotifyHandle,
    req: NewOrder,
    now: DateTime<Utc>,
) -> Result<CreatedOrder, OrderError> {
    if req.items.is_empty() {
        return Err(OrderError::Validation("order must include at least one item".into()));
    }

    let mut condensed: HashMap<Uuid, i32> = HashMap::new();
    for item in &req.items {
        if item.quantity <= 0 {
            return Err(OrderError::Validation(format!(
                "quantity for ticket type {} must be positive",
                item.ticket_type_id
            )));
        }
        *condensed.entry(item.ticket_type_id).or_insert(0) += item.quantity;
    }

    // Snapshot the ticket types up front; prices on the order never move
    // again even if the catalog row changes later.
    let mut types = Vec::with_capacity(condensed.len());
    for (&ticket_type_id, &quantity) in condensed.iter() {
        let ticket_type = inventory::get_ticket_type(db, ticket_type_id)
            .await?
            .ok_or_else(|| {
                OrderError::Validation(format!("ticket type {ticket_type_id} does not exist"))
            })?;
        if !ticket_type.is_active {
            return Err(OrderError::Validation(format!(
                "ticket type {} is not on sale",
                ticket_type.name
            )));
        }
        if let Some(start) = ticket_type.sales_start {
            if now < start {
                return Err(OrderError::Validation(format!(
                    "sales for {} have not started",
                    ticket_type.name
                )));
            }
        }
        if let Some(end) = ticket_type.sales_end {
            if now >= end {
                return Err(OrderError::Validation(format!(
                    "sales for {} have ended",
                    ticket_type.name
                )));
            }
        }
        types.push((ticket_type, quantity));
    }

    let currency = types[0].0.currency.clone();
    if types.iter().any(|(t, _)| t.currency != currency) {
        return Err(OrderError::Validation("order mixes currencies".into()));
    }

    // A waitlist conversion claims one unit from the entry's soft hold.
    let conversion = match req.waitlist_entry_id {
        Some(entry_id) => {
            let entry = waitlist::get_entry(db, entry_id)
                .await?
                .ok_or_else(|| OrderError::Validation(format!("waitlist entry {entry_id} does not exist")))?;
            if WaitlistStatus::parse(&entry.status) != Some(WaitlistStatus::Notified) {
                return Err(OrderError::Validation(
                    "waitlist entry is not eligible for purchase".into(),
                ));
            }
            if entry.purchase_window_end.map(|end| now >= end).unwrap_or(true) {
                return Err(OrderError::Validation("waitlist purchase window has closed".into()));
            }
            if !entry.buyer_email.eq_ignore_ascii_case(&req.buyer_email) {
                return Err(OrderError::Validation(
                    "waitlist entry belongs to a different buyer".into(),
                ));
            }
            if !condensed.contains_key(&entry.ticket_type_id) {
                return Err(OrderError::Validation(
                    "order does not include the waitlisted ticket type".into(),
                ));
            }
            Some(entry)
        }
        None => None,
    };

    let mut reservations: Vec<Reservation> = Vec::new();
    for (ticket_type, quantity) in &types {
        let hold_quantity = match &conversion {
            Some(entry) if entry.ticket_type_id == ticket_type.id => (*quantity).min(1),
            _ => 0,
        };
        let public_quantity = *quantity - hold_quantity;
        for (portion, from_hold) in [(hold_quantity, true), (public_quantity, false)] {
            if portion == 0 {
                continue;
            }
            match inventory::reserve(db, metrics, ticket_type.id, portion, from_hold).await {
                Ok(reservation) => reservations.push(reservation),
                Err(err) => {
                    // All-or-nothing: a failed line item releases everything
                    // reserved so far before the rejection surfaces.
                    release_reservations(db, metrics, &reservations).await;
                    return Err(err.into());
                }
            }
        }
    }

    let candidates: Vec<CandidateItem> = types
        .iter()
        .map(|(t, q)| CandidateItem {
            ticket_type_id: t.id,
            unit_price_minor: t.price_minor,
            quantity: *q,
        })
        .collect();

    let mut subtotal = Money::ZERO;
    for c in &candidates {
        let line = Money::from_cents(c.unit_price_minor * c.quantity as i64);
        subtotal = subtotal.checked_add(line).map_err(|_| {
            OrderError::Validation("order total overflows".into())
        })?;
    }

    let (promo_id, discount) = match &req.promo_code {
        Some(code) => {
            match promo::validate(db, code, req.edition_id, &candidates, &req.buyer_email, now).await
            {
                Ok((promo, discount)) => (Some(promo.id), discount),
                Err(err) => {
                    release_reservations(db, metrics, &reservations).await;
                    return Err(err.into());
                }
            }
        }
        None => (None, Money::ZERO),
    };
    let total = subtotal.saturating_sub(discount);

    let order_id = Uuid::new_v4();

    if let Some(entry) = &conversion {
        if let Err(err) = waitlist::convert(db, entry.id, order_id).await {
            release_reservations(db, metrics, &reservations).await;
            return Err(err.into());
        }
    }

    sqlx::query(
        "INSERT INTO orders (id, edition_id, buyer_email, buyer_name, status, currency, \
                             total_minor, discount_minor, promo_code_id) \
         VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8)",
    )
    .bind(order_id)
    .bind(req.edition_id)
    .bind(&req.buyer_email)
    .bind(&req.buyer_name)
    .bind(&currency)
    .bind(total.cents())
    .bind(discount.cents())
    .bind(promo_id)
    .execute(db)
    .await?;

    for (ticket_type, quantity) in &types {
        sqlx::query(
            "INSERT INTO order_items (id, order_id, ticket_type_id, quantity, unit_price_minor) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(order_id)
        .bind(ticket_type.id)
        .bind(quantity)
        .bind(ticket_type.price_minor)
        .execute(db)
        .await?;
    }

    tracing::info!(
        order_id = %order_id,
        edition_id = %req.edition_id,
        total_minor = total.cents(),
        "Order created"
    );

    if total.is_zero() {
        let outcome = complete_order(db, metrics, notify, order_id, None).await?;
        let items = list_items(db, order_id).await?;
        return Ok(CreatedOrder {
            order: outcome.order,
            items,
            tickets: outcome.tickets,
            completed: true,
        });
    }

    let order = get_order(db, order_id).await?;
    let items = list_items(db, order_id).await?;
    Ok(CreatedOrder { order, items, tickets: Vec::new(), completed: false })
}

/// Complete an order (`pending -> paid`). Idempotent: an already-paid order
/// returns its existing ticket set; finalize and issuance are themselves
/// idempotent, so a retry after a partial failure converges instead of
/// compounding.
pub async fn complete_order(
    db: &PgPool,
    metrics: &FulfillmentMetrics,
    notify: &NotifyHandle,
    order_id: Uuid,
    payment_reference: Option<&str>,
) -> Result<CompletionOutcome, OrderError> {
    let order = get_order(db, order_id).await?;
    let status = OrderStatus::parse(&order.status)
        .ok_or_else(|| OrderError::Validation(format!("order {order_id} has a corrupt status")))?;
    if status == OrderStatus::Paid {
        let tickets = tickets::list_for_order(db, order_id).await?;
        return Ok(CompletionOutcome { order, tickets, already_paid: true });
    }
    if !is_valid_transition(status, OrderStatus::Paid) {
        return Err(OrderError::InvalidTransition { from: status.as_str(), to: "paid" });
    }

    let items = list_items(db, order_id).await?;
    let mut issued = Vec::new();
    for item in &items {
        inventory::finalize(&Reservation {
            ticket_type_id: item.ticket_type_id,
            quantity: item.quantity,
            from_hold: false,
        });
        issued.extend(tickets::issue(db, metrics, item).await?);
    }

    // Exactly one caller wins the flip; the promo counter and the
    // confirmation ride on that unique transition.
    let won = sqlx::query(
        "UPDATE orders SET status = 'paid', \
                payment_reference = COALESCE($2, payment_reference), updated_at = now() \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(order_id)
    .bind(payment_reference)
    .execute(db)
    .await?
    .rows_affected()
        == 1;

    if won {
        if let Some(promo_id) = order.promo_code_id {
            promo::record_usage(db, promo_id).await?;
        }
        notify.fire(NotificationKind::OrderConfirmed, order_id);
        tracing::info!(order_id = %order_id, tickets = issued.len(), "Order completed");
    } else {
        let current = get_order(db, order_id).await?;
        match OrderStatus::parse(&current.status) {
            Some(OrderStatus::Paid) => {
                // A concurrent retry won the flip; same outcome either way.
            }
            Some(other) => {
                // Lost against a concurrent cancellation/expiry: withdraw
                // the tickets minted above and report the dead transition.
                tickets::invalidate_for_order(db, order_id).await?;
                return Err(OrderError::InvalidTransition {
                    from: other.as_str(),
                    to: "paid",
                });
            }
            None => {
                return Err(OrderError::Validation(format!(
                    "order {order_id} has a corrupt status"
                )))
            }
        }
    }

    let order = get_order(db, order_id).await?;
    let tickets = tickets::list_for_order(db, order_id).await?;
    Ok(CompletionOutcome { order, tickets, already_paid: !won })
}

/// Free reserved/sold capacity for every not-yet-released item, offering
/// each freed batch to the waitlist before the public pool. Item-level
/// release flags keep the pass convergent across retries.
async fn release_order_capacity(
    db: &PgPool,
    metrics: &FulfillmentMetrics,
    notify: &NotifyHandle,
    order_id: Uuid,
    purchase_window: Duration,
) -> Result<(), OrderError> {
    let items = list_items(db, order_id).await?;
    for item in items.iter().filter(|i| !i.released) {
        let claimed = sqlx::query(
            "UPDATE order_items SET released = TRUE WHERE id = $1 AND released = FALSE",
        )
        .bind(item.id)
        .execute(db)
        .await?
        .rows_affected()
            == 1;
        if !claimed {
            continue;
        }
        let promoted = waitlist::promote_next(
            db,
            metrics,
            notify,
            item.ticket_type_id,
            item.quantity,
            purchase_window,
        )
        .await?;
        if let Err(err) =
            inventory::release(db, metrics, item.ticket_type_id, item.quantity, promoted).await
        {
            // Hand the item back so a retry can redo it.
            let _ = sqlx::query("UPDATE order_items SET released = FALSE WHERE id = $1")
                .bind(item.id)
                .execute(db)
                .await;
            return Err(err.into());
        }
    }
    Ok(())
}

/// Cancel a pending order (`pending -> cancelled`): releases the
/// reservation and offers the freed capacity to the waitlist. Safe to call
/// repeatedly; a repeat run only finishes whatever release work is left.
pub async fn cancel_order(
    db: &PgPool,
    metrics: &FulfillmentMetrics,
    notify: &NotifyHandle,
    order_id: Uuid,
    purchase_window: Duration,
) -> Result<Order, OrderError> {
    let order = get_order(db, order_id).await?;
    let status = OrderStatus::parse(&order.status)
        .ok_or_else(|| OrderError::Validation(format!("order {order_id} has a corrupt status")))?;
    if status == OrderStatus::Cancelled {
        release_order_capacity(db, metrics, notify, order_id, purchase_window).await?;
        return Ok(order);
    }
    if !is_valid_transition(status, OrderStatus::Cancelled) {
        return Err(OrderError::InvalidTransition { from: status.as_str(), to: "cancelled" });
    }

    let won = sqlx::query(
        "UPDATE orders SET status = 'cancelled', updated_at = now() \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(order_id)
    .execute(db)
    .await?
    .rows_affected()
        == 1;

    if !won {
        let current = get_order(db, order_id).await?;
        match OrderStatus::parse(&current.status) {
            Some(OrderStatus::Cancelled) => {}
            Some(other) => {
                return Err(OrderError::InvalidTransition {
                    from: other.as_str(),
                    to: "cancelled",
                })
            }
            None => {
                return Err(OrderError::Validation(format!(
                    "order {order_id} has a corrupt status"
                )))
            }
        }
    }

    release_order_capacity(db, metrics, notify, order_id, purchase_window).await?;
    if won {
        notify.fire(NotificationKind::OrderCancelled, order_id);
        tracing::info!(order_id = %order_id, "Order cancelled");
    }
    get_order(db, order_id).await
}

/// Refund a paid order (`paid -> refunded`): invalidates every issued
/// ticket, then releases the sold capacity with the same waitlist-first
/// offer as cancellation.
pub async fn refund_order(
    db: &PgPool,
    metrics: &FulfillmentMetrics,
    notify: &NotifyHandle,
    order_id: Uuid,
    purchase_window: Duration,
) -> Result<Order, OrderError> {
    let order = get_order(db, order_id).await?;
    let status = OrderStatus::parse(&order.status)
        .ok_or_else(|| OrderError::Validation(format!("order {order_id} has a corrupt status")))?;
    if status == OrderStatus::Refunded {
        tickets::invalidate_for_order(db, order_id).await?;
        release_order_capacity(db, metrics, notify, order_id, purchase_window).await?;
        return Ok(order);
    }
    if !is_valid_transition(status, OrderStatus::Refunded) {
        return Err(OrderError::InvalidTransition { from: status.as_str(), to: "refunded" });
    }

    let won = sqlx::query(
        "UPDATE orders SET status = 'refunded', updated_at = now() \
         WHERE id = $1 AND status = 'paid'",
    )
    .bind(order_id)
    .execute(db)
    .await?
    .rows_affected()
        == 1;

    if !won {
        let current = get_order(db, order_id).await?;
        match OrderStatus::parse(&current.status) {
            Some(OrderStatus::Refunded) => {}
            Some(other) => {
                return Err(OrderError::InvalidTransition {
                    from: other.as_str(),
                    to: "refunded",
                })
            }
            None => {
                return Err(OrderError::Validation(format!(
                    "order {order_id} has a corrupt status"
                )))
            }
        }
    }

    tickets::invalidate_for_order(db, order_id).await?;
    release_order_capacity(db, metrics, notify, order_id, purchase_window).await?;
    if won {
        notify.fire(NotificationKind::OrderRefunded, order_id);
        tracing::info!(order_id = %order_id, "Order refunded");
    }
    get_order(db, order_id).await
}
