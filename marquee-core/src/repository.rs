use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{BrokerError, StoreError};
use crate::mail::{Delivery, MessageHeaders};
use crate::models::{IdempotencyRecord, LedgerEntry, Seat, Ticket};

/// Static per-venue seat definitions.
#[async_trait]
pub trait SeatInventory: Send + Sync {
    /// Inserts all seats or none. Collisions on (venue, row, column) or (venue, seat number)
    /// surface as `StoreError::UniqueViolation`.
    async fn add_seats(&self, seats: &[Seat]) -> Result<u64, StoreError>;

    async fn seats_for_venue(&self, venue_id: Uuid) -> Result<Vec<Seat>, StoreError>;
}

/// The Showtime Seat Ledger. Every mutation goes through a [`LedgerTransaction`].
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>, StoreError>;

    /// Unlocked snapshot read.
    async fn entries_for_showtime(&self, showtime_id: Uuid) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Frees every un-finalized entry whose hold elapsed at or before `now`.
    async fn release_expired_holds(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// A unit of work over the ledger.
///
/// Dropping a transaction without calling [`LedgerTransaction::commit`] rolls it back and
/// releases every row lock it holds, on every exit path including unwinding.
#[async_trait]
pub trait LedgerTransaction: Send {
    /// Reads an entry while taking an exclusive row lock on it (`SELECT ... FOR UPDATE`).
    /// Blocks while another transaction holds the lock.
    async fn lock_entry(&mut self, showtime_id: Uuid, seat_id: Uuid) -> Result<Option<LedgerEntry>, StoreError>;

    /// Writes back an entry previously returned by `lock_entry`. Returns rows affected.
    async fn update_entry(&mut self, entry: &LedgerEntry) -> Result<u64, StoreError>;

    /// Bulk insert used by showtime fan-out. A duplicate (showtime, seat) pair surfaces as
    /// `StoreError::UniqueViolation`.
    async fn insert_entries(&mut self, entries: &[LedgerEntry]) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Idempotency records and the tickets issued against them.
#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn save_idempotency_record(&self, record: &IdempotencyRecord) -> Result<(), StoreError>;

    async fn find_idempotency_record(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Inserts the ticket and flips its record from "not issued" to "issued" atomically.
    ///
    /// Returns the number of ticket rows written. A reused transaction id surfaces as
    /// `StoreError::UniqueViolation`; a record that is already issued as `StoreError::StaleWrite`.
    /// Neither leaves a ticket row behind.
    async fn insert_ticket(&self, ticket: &Ticket) -> Result<u64, StoreError>;

    async fn mark_mail_enqueued(&self, key: &str) -> Result<(), StoreError>;

    async fn find_ticket(&self, transaction_id: &str) -> Result<Option<Ticket>, StoreError>;
}

/// A durable queue with manual acknowledgement.
#[async_trait]
pub trait MailQueue: Send + Sync {
    /// Next message from the work queue. `None` once the underlying stream has ended.
    async fn receive(&self) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Negative acknowledgement. With `requeue` the message is delivered again later,
    /// otherwise it is discarded.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError>;

    async fn publish(&self, queue: &str, body: &[u8], headers: &MessageHeaders) -> Result<(), BrokerError>;
}
