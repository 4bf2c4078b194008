//! Periodic countdown producer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::EmergencyService;

/// Tick the auto-cancel countdown every `period` until `shutdown` fires.
pub async fn run_countdown(
    service: Arc<EmergencyService>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("Countdown loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                if let Some(countdown) = service.tick(Utc::now()).await {
                    debug!(
                        remaining_secs = countdown.remaining_secs(),
                        expired = countdown.expired,
                        "Countdown tick"
                    );
                }
            }
        }
    }
}
