use chrono::{DateTime, Utc};
use marquee_core::{
    BookingError, BookingResult, LedgerEntry, LedgerStore, LedgerTransaction, NewSeat, Seat,
    SeatAvailability, SeatInventory, StoreError,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

// Width of the seat_number column.
const MAX_SEAT_NUMBER_LEN: usize = 16;

/// Seat registration, showtime fan-out and availability reads.
pub struct ShowtimeLedger {
    seats: Arc<dyn SeatInventory>,
    ledger: Arc<dyn LedgerStore>,
}

impl ShowtimeLedger {
    pub fn new(seats: Arc<dyn SeatInventory>, ledger: Arc<dyn LedgerStore>) -> Self {
        Self { seats, ledger }
    }

    /// Registers a venue's seats in one batch, all or none.
    pub async fn register_seats(&self, venue_id: Uuid, seats: Vec<NewSeat>) -> BookingResult<Vec<Seat>> {
        if seats.is_empty() {
            return Err(BookingError::InvalidRequest("no seats given".to_string()));
        }

        let mut positions = HashSet::new();
        let mut numbers = HashSet::new();
        for seat in &seats {
            if seat.seat_number.trim().is_empty() {
                return Err(BookingError::InvalidRequest("seat number is empty".to_string()));
            }
            if seat.seat_number.chars().count() > MAX_SEAT_NUMBER_LEN {
                return Err(BookingError::InvalidRequest(format!(
                    "seat number {} is longer than {} characters",
                    seat.seat_number, MAX_SEAT_NUMBER_LEN
                )));
            }
            if seat.row < 0 || seat.column < 0 || seat.price < 0 {
                return Err(BookingError::InvalidRequest(format!(
                    "seat {} has a negative row, column or price",
                    seat.seat_number
                )));
            }
            if !positions.insert((seat.row, seat.column)) {
                return Err(BookingError::SeatConflict(format!(
                    "row {} column {} given twice",
                    seat.row, seat.column
                )));
            }
            if !numbers.insert(seat.seat_number.clone()) {
                return Err(BookingError::SeatConflict(format!(
                    "seat number {} given twice",
                    seat.seat_number
                )));
            }
        }

        let seats: Vec<Seat> = seats
            .into_iter()
            .map(|seat| Seat::from_new(venue_id, seat))
            .collect();

        match self.seats.add_seats(&seats).await {
            Ok(count) => {
                info!("Registered {} seats for venue {}", count, venue_id);
                Ok(seats)
            }
            Err(StoreError::UniqueViolation(constraint)) => Err(BookingError::SeatConflict(constraint)),
            Err(e) => Err(e.into()),
        }
    }

    /// Creates one free ledger entry per seat of the venue hosting the showtime.
    pub async fn open_showtime(&self, showtime_id: Uuid, venue_id: Uuid) -> BookingResult<u64> {
        let seats = self.seats.seats_for_venue(venue_id).await?;
        if seats.is_empty() {
            return Err(BookingError::VenueHasNoSeats(venue_id));
        }

        let entries: Vec<LedgerEntry> = seats
            .iter()
            .map(|seat| LedgerEntry::fresh(showtime_id, seat))
            .collect();

        let mut tx = self.ledger.begin().await?;
        let inserted = match tx.insert_entries(&entries).await {
            Ok(n) => n,
            Err(StoreError::UniqueViolation(_)) => {
                warn!("Showtime {} already has a seat ledger", showtime_id);
                return Err(BookingError::ShowtimeAlreadyOpened(showtime_id));
            }
            Err(e) => return Err(e.into()),
        };
        tx.commit().await?;

        info!("Opened showtime {} with {} seats from venue {}", showtime_id, inserted, venue_id);
        Ok(inserted)
    }

    /// Derived state of every seat of a showtime as of `now`. Elapsed holds read as free.
    pub async fn availability(&self, showtime_id: Uuid, now: DateTime<Utc>) -> BookingResult<Vec<SeatAvailability>> {
        let entries = self.ledger.entries_for_showtime(showtime_id).await?;
        Ok(entries
            .into_iter()
            .map(|entry| SeatAvailability {
                entry_id: entry.id,
                seat_id: entry.seat_id,
                seat_number: entry.seat_number.clone(),
                state: entry.state_at(now),
            })
            .collect())
    }
}

/// Sorted and de-duplicated, so every caller takes row locks in the same order.
pub(crate) fn lock_order(seat_ids: &[Uuid]) -> BookingResult<Vec<Uuid>> {
    if seat_ids.is_empty() {
        return Err(BookingError::InvalidRequest("no seats requested".to_string()));
    }
    let mut ordered = seat_ids.to_vec();
    ordered.sort();
    ordered.dedup();
    Ok(ordered)
}

/// Locks the ledger entry of every seat, failing on the first one missing.
pub(crate) async fn lock_entries(
    tx: &mut dyn LedgerTransaction,
    showtime_id: Uuid,
    seat_ids: &[Uuid],
) -> BookingResult<Vec<LedgerEntry>> {
    let mut entries = Vec::with_capacity(seat_ids.len());
    for &seat_id in seat_ids {
        match tx.lock_entry(showtime_id, seat_id).await? {
            Some(entry) => entries.push(entry),
            None => return Err(BookingError::SeatNotFound { showtime_id, seat_id }),
        }
    }
    Ok(entries)
}

/// Writes back one locked entry, treating anything but a single row as fatal.
pub(crate) async fn write_entry(tx: &mut dyn LedgerTransaction, entry: &LedgerEntry) -> BookingResult<()> {
    match tx.update_entry(entry).await? {
        1 => Ok(()),
        _ => Err(BookingError::LedgerWriteFailed(entry.id)),
    }
}
