use marquee_core::{BookingConfirmation, BookingError, BookingResult, ContactValidator, LedgerStore};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ledger::{lock_entries, lock_order, write_entry};

/// Turns held (or free) seats into a finalized sale under exclusive row locks.
///
/// The ledger transaction rolls back when it is dropped, so an early return or a panic anywhere
/// between `begin` and `commit` leaves no partial booking behind.
pub struct BookingCommitter {
    ledger: Arc<dyn LedgerStore>,
    validator: ContactValidator,
}

impl BookingCommitter {
    pub fn new(ledger: Arc<dyn LedgerStore>, validator: ContactValidator) -> Self {
        Self { ledger, validator }
    }

    pub async fn commit_booking(
        &self,
        showtime_id: Uuid,
        email: &str,
        phone_number: &str,
        seat_ids: &[Uuid],
    ) -> BookingResult<BookingConfirmation> {
        // 1. Validate input before taking any lock
        let contact = self.validator.validate(email, phone_number)?;
        let seat_ids = lock_order(seat_ids)?;

        // 2. Lock every row, then check the set
        let mut tx = self.ledger.begin().await?;
        let mut entries = lock_entries(&mut *tx, showtime_id, &seat_ids).await?;

        if let Some(sold) = entries.iter().find(|e| e.is_finalized()) {
            warn!(
                "Seat {} of showtime {} is already sold, rolling back",
                sold.seat_number, showtime_id
            );
            return Err(BookingError::SeatAlreadyBooked {
                seat_id: sold.seat_id,
                seat_number: sold.seat_number.clone(),
            });
        }

        // 3. Write contact into every entry and commit as one unit
        for entry in entries.iter_mut() {
            entry.finalize(&contact);
            write_entry(&mut *tx, entry).await?;
        }
        tx.commit().await?;

        info!(
            "Booked {} seats for showtime {} (contact {})",
            entries.len(),
            showtime_id,
            contact.email
        );
        Ok(BookingConfirmation {
            showtime_id,
            entry_ids: entries.iter().map(|e| e.id).collect(),
            seat_numbers: entries.into_iter().map(|e| e.seat_number).collect(),
        })
    }
}
