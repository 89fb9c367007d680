use chrono::{TimeZone, Utc};
use marquee_core::{ManualClock, NewSeat, Seat};
use marquee_store::MemoryStore;
use std::sync::Arc;
use uuid::Uuid;

use crate::ShowtimeLedger;

/// One venue with a single row of seats A1..An, opened for one showtime.
pub struct Fixture {
    pub store: MemoryStore,
    pub clock: Arc<ManualClock>,
    pub showtime_id: Uuid,
    pub seats: Vec<Seat>,
}

impl Fixture {
    pub async fn new(seat_count: i32) -> Self {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 14, 19, 30, 0).unwrap()));
        let ledger = ShowtimeLedger::new(Arc::new(store.clone()), Arc::new(store.clone()));

        let venue_id = Uuid::new_v4();
        let new_seats = (1..=seat_count)
            .map(|n| NewSeat {
                seat_number: format!("A{}", n),
                row: 1,
                column: n,
                price: 1200,
                category: "STANDARD".to_string(),
            })
            .collect();
        let seats = ledger.register_seats(venue_id, new_seats).await.unwrap();

        let showtime_id = Uuid::new_v4();
        ledger.open_showtime(showtime_id, venue_id).await.unwrap();

        Self {
            store,
            clock,
            showtime_id,
            seats,
        }
    }

    pub fn seat_id(&self, number: &str) -> Uuid {
        self.seats
            .iter()
            .find(|s| s.seat_number == number)
            .map(|s| s.id)
            .unwrap()
    }
}
