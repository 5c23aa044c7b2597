use std::time::Duration;

use chrono::Utc;

use crate::app::AppState;
use crate::waitlist;

/// Periodic sweep that expires lapsed purchase windows and re-offers the
/// freed hold down the queue. Runs outside the request path.
pub fn spawn_waitlist_sweeper(state: AppState, sweep_interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(sweep_interval).await;
            let start = std::time::Instant::now();
            match waitlist::expire_stale(
                &state.db,
                &state.metrics,
                &state.notify,
                state.purchase_window,
                Utc::now(),
            )
            .await
            {
                Ok(0) => {}
                Ok(expired) => {
                    tracing::info!(expired, "Waitlist sweep expired stale entries");
                }
                Err(err) => {
                    tracing::error!(error = %err, "Waitlist sweeper error");
                }
            }
            let elapsed = start.elapsed().as_secs_f64();
            state.metrics.sweeper_duration_seconds.observe(elapsed);
        }
    });
}
