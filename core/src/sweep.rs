use std::time::Duration;

use billing::Billing;
use tokio::time::{MissedTickBehavior, interval};

/// Periodically expires lapsed trials and canceled periods so rows do not
/// wait for the next read to be corrected.
pub fn spawn(billing: Billing, every: Duration) {
    actix_web::rt::spawn(async move {
        let mut ticker = interval(every.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            // the engine logs how many rows it moved
            if let Err(err) = billing.sweep().await {
                log::error!("Expiry sweep failed: {}", err);
            }
        }
    });
}
