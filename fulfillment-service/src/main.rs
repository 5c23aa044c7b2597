use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::env;

use common_money::log_rounding_mode_once;
use common_observability::FulfillmentMetrics;
use sqlx::PgPool;
use tokio::net::TcpListener;

use fulfillment_service::app::{build_router, AppState};
use fulfillment_service::notify::{HttpNotifier, NoopNotifier, Notifier, NotifyHandle};
use fulfillment_service::provider::{ProviderRegistry, StripeProvider, StubProvider};
use fulfillment_service::sweeper::spawn_waitlist_sweeper;

const DEFAULT_PURCHASE_WINDOW_HOURS: i64 = 48;
const DEFAULT_SWEEP_SECS: u64 = 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    log_rounding_mode_once();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let db_pool = PgPool::connect(&database_url).await?;
    sqlx::migrate!("./migrations").run(&db_pool).await?;

    let purchase_window_hours = env::var("PURCHASE_WINDOW_HOURS")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(DEFAULT_PURCHASE_WINDOW_HOURS);
    let sweep_interval = env::var("WAITLIST_SWEEP_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(DEFAULT_SWEEP_SECS));
    let default_provider =
        env::var("DEFAULT_PAYMENT_PROVIDER").unwrap_or_else(|_| "stripe".to_string());
    let checkout_success_url = env::var("CHECKOUT_SUCCESS_URL")
        .unwrap_or_else(|_| "http://localhost:3000/checkout/success".to_string());
    let checkout_cancel_url = env::var("CHECKOUT_CANCEL_URL")
        .unwrap_or_else(|_| "http://localhost:3000/checkout/cancelled".to_string());

    let providers = Arc::new(
        ProviderRegistry::new()
            .register(Arc::new(StripeProvider::from_env()))
            .register(Arc::new(StubProvider::from_env())),
    );

    let metrics = Arc::new(FulfillmentMetrics::new());
    let notifier: Arc<dyn Notifier> = match env::var("NOTIFY_BASE_URL") {
        Ok(base_url) => Arc::new(HttpNotifier::new(base_url)),
        Err(_) => {
            tracing::warn!("NOTIFY_BASE_URL not set; notifications are dropped");
            Arc::new(NoopNotifier)
        }
    };
    let notify = NotifyHandle::new(notifier, metrics.clone());

    let state = AppState {
        db: db_pool,
        providers,
        notify,
        metrics,
        purchase_window: chrono::Duration::hours(purchase_window_hours),
        default_provider,
        checkout_success_url,
        checkout_cancel_url,
    };

    spawn_waitlist_sweeper(state.clone(), sweep_interval);

    let app = build_router(state);

    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8090);
    let ip: std::net::IpAddr = host.parse()?;
    let addr = SocketAddr::from((ip, port));
    tracing::info!(%addr, "starting fulfillment-service");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
