use chrono::Duration;
use marquee_core::{BookingError, BookingResult, Clock, HoldReceipt, LedgerStore, SeatState};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::ledger::{lock_entries, lock_order, write_entry};

/// Places time-bounded holds on ledger entries ahead of payment.
pub struct HoldManager {
    ledger: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    default_hold: Duration,
}

impl HoldManager {
    pub fn new(ledger: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, default_hold: Duration) -> Self {
        Self {
            ledger,
            clock,
            default_hold,
        }
    }

    /// Holds every requested seat or none of them.
    ///
    /// Fails with the first conflicting seat: `SeatAlreadyBooked` for a sold seat, `SeatLocked`
    /// for one under a hold that has not elapsed yet. `hold` falls back to the configured default.
    pub async fn place_hold(
        &self,
        showtime_id: Uuid,
        seat_ids: &[Uuid],
        hold: Option<Duration>,
    ) -> BookingResult<HoldReceipt> {
        let hold = hold.unwrap_or(self.default_hold);
        if hold <= Duration::zero() {
            return Err(BookingError::InvalidRequest("hold duration must be positive".to_string()));
        }
        let seat_ids = lock_order(seat_ids)?;

        let mut tx = self.ledger.begin().await?;
        let mut entries = lock_entries(&mut *tx, showtime_id, &seat_ids).await?;

        // 1. Validate the whole set under the locks
        let now = self.clock.now();
        for entry in &entries {
            match entry.state_at(now) {
                SeatState::Free => {}
                SeatState::Held { until } => {
                    debug!("Seat {} of showtime {} held until {}", entry.seat_number, showtime_id, until);
                    return Err(BookingError::SeatLocked {
                        seat_id: entry.seat_id,
                        seat_number: entry.seat_number.clone(),
                        until,
                    });
                }
                SeatState::Booked => {
                    return Err(BookingError::SeatAlreadyBooked {
                        seat_id: entry.seat_id,
                        seat_number: entry.seat_number.clone(),
                    });
                }
            }
        }

        // 2. Mutate only once every seat passed
        let expires_at = now + hold;
        for entry in entries.iter_mut() {
            entry.place_hold(expires_at);
            write_entry(&mut *tx, entry).await?;
        }
        tx.commit().await?;

        info!(
            "Held {} seats for showtime {} until {}",
            seat_ids.len(),
            showtime_id,
            expires_at
        );
        Ok(HoldReceipt {
            showtime_id,
            seat_ids,
            expires_at,
        })
    }

    /// Frees held seats before their expiry. Finalized seats fail the whole call.
    pub async fn release_hold(&self, showtime_id: Uuid, seat_ids: &[Uuid]) -> BookingResult<u64> {
        let seat_ids = lock_order(seat_ids)?;

        let mut tx = self.ledger.begin().await?;
        let mut entries = lock_entries(&mut *tx, showtime_id, &seat_ids).await?;

        if let Some(sold) = entries.iter().find(|e| e.is_finalized()) {
            return Err(BookingError::SeatAlreadyBooked {
                seat_id: sold.seat_id,
                seat_number: sold.seat_number.clone(),
            });
        }

        let mut released = 0;
        for entry in entries.iter_mut() {
            if !entry.is_booked && entry.hold_expires_at.is_none() {
                continue;
            }
            entry.release();
            write_entry(&mut *tx, entry).await?;
            released += 1;
        }
        tx.commit().await?;

        info!("Released {} held seats for showtime {}", released, showtime_id);
        Ok(released)
    }
}
