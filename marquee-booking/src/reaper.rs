use marquee_core::{BookingResult, Clock, LedgerStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Periodically frees elapsed holds so listings stop showing them.
///
/// Holds are already re-validated lazily on every hold and commit, so this only tidies up.
pub struct HoldReaper {
    ledger: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl HoldReaper {
    pub fn new(ledger: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self { ledger, clock, interval }
    }

    pub async fn sweep_once(&self) -> BookingResult<u64> {
        let released = self.ledger.release_expired_holds(self.clock.now()).await?;
        if released > 0 {
            info!("Reaper released {} expired holds", released);
        } else {
            debug!("Reaper found no expired holds");
        }
        Ok(released)
    }

    /// Sweeps every interval until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        info!("Hold reaper started, sweeping every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!("Reaper sweep failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Hold reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use crate::HoldManager;
    use chrono::Duration as ChronoDuration;
    use marquee_core::SeatState;

    #[tokio::test]
    async fn test_sweep_frees_only_elapsed_holds() {
        let fx = Fixture::new(2).await;
        let holds = HoldManager::new(Arc::new(fx.store.clone()), fx.clock.clone(), ChronoDuration::minutes(15));
        let (a1, a2) = (fx.seat_id("A1"), fx.seat_id("A2"));

        holds.place_hold(fx.showtime_id, &[a1], None).await.unwrap();
        fx.clock.advance(ChronoDuration::minutes(10));
        holds.place_hold(fx.showtime_id, &[a2], None).await.unwrap();
        fx.clock.advance(ChronoDuration::minutes(6));

        let reaper = HoldReaper::new(Arc::new(fx.store.clone()), fx.clock.clone(), Duration::from_secs(60));
        assert_eq!(reaper.sweep_once().await.unwrap(), 1);

        let freed = fx.store.entry(fx.showtime_id, a1).unwrap();
        assert!(!freed.is_booked);
        assert!(freed.hold_expires_at.is_none());
        assert!(matches!(
            fx.store.entry(fx.showtime_id, a2).unwrap().state_at(fx.clock.now()),
            SeatState::Held { .. }
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let fx = Fixture::new(1).await;
        let reaper = HoldReaper::new(Arc::new(fx.store.clone()), fx.clock.clone(), Duration::from_millis(10));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { reaper.run(rx).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
