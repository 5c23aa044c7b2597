use prometheus::{Histogram, IntCounter, IntCounterVec, Registry};

#[derive(Clone)]
pub struct FulfillmentMetrics {
    pub registry: Registry,
    pub capacity_cas_conflicts: IntCounter,
    pub capacity_rejections: IntCounter,
    pub webhook_duplicates: IntCounter,
    pub webhook_rejected: IntCounterVec,
    pub tickets_issued: IntCounter,
    pub waitlist_promotions: IntCounter,
    pub waitlist_expirations: IntCounter,
    pub notify_failures: IntCounter,
    pub sweeper_duration_seconds: Histogram,
    pub http_errors_total: IntCounterVec,
}

impl FulfillmentMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let capacity_cas_conflicts = IntCounter::new(
            "inventory_cas_conflicts_total",
            "Version conflicts hit by the capacity compare-and-swap loop",
        ).unwrap();
        let capacity_rejections = IntCounter::new(
            "inventory_capacity_rejections_total",
            "Reservations rejected for insufficient capacity",
        ).unwrap();
        let webhook_duplicates = IntCounter::new(
            "webhook_duplicate_events_total",
            "Webhook deliveries acknowledged via the idempotency gate",
        ).unwrap();
        let webhook_rejected = IntCounterVec::new(
            prometheus::Opts::new(
                "webhook_rejected_total",
                "Webhook deliveries rejected before processing",
            ),
            &["provider", "reason"],
        ).unwrap();
        let tickets_issued = IntCounter::new(
            "tickets_issued_total",
            "Tickets minted for paid order items",
        ).unwrap();
        let waitlist_promotions = IntCounter::new(
            "waitlist_promotions_total",
            "Waitlist entries promoted to notified",
        ).unwrap();
        let waitlist_expirations = IntCounter::new(
            "waitlist_expirations_total",
            "Notified waitlist entries expired by the sweeper",
        ).unwrap();
        let notify_failures = IntCounter::new(
            "notification_dispatch_failures_total",
            "Fire-and-forget notification deliveries that failed",
        ).unwrap();
        let sweeper_duration_seconds = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "waitlist_sweeper_duration_seconds",
                "Duration of a purchase-window expiry sweep",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]),
        ).unwrap();
        let http_errors_total = IntCounterVec::new(
            prometheus::Opts::new(
                "http_errors_total",
                "Count of HTTP error responses emitted (status >= 400)",
            ),
            &["service", "code", "status"],
        ).unwrap();
        let _ = registry.register(Box::new(capacity_cas_conflicts.clone()));
        let _ = registry.register(Box::new(capacity_rejections.clone()));
        let _ = registry.register(Box::new(webhook_duplicates.clone()));
        let _ = registry.register(Box::new(webhook_rejected.clone()));
        let _ = registry.register(Box::new(tickets_issued.clone()));
        let _ = registry.register(Box::new(waitlist_promotions.clone()));
        let _ = registry.register(Box::new(waitlist_expirations.clone()));
        let _ = registry.register(Box::new(notify_failures.clone()));
        let _ = registry.register(Box::new(sweeper_duration_seconds.clone()));
        let _ = registry.register(Box::new(http_errors_total.clone()));
        FulfillmentMetrics {
            registry,
            capacity_cas_conflicts,
            capacity_rejections,
            webhook_duplicates,
            webhook_rejected,
            tickets_issued,
            waitlist_promotions,
            waitlist_expirations,
            notify_failures,
            sweeper_duration_seconds,
            http_errors_total,
        }
    }
}

impl Default for FulfillmentMetrics {
    fn default() -> Self {
        Self::new()
    }
}
