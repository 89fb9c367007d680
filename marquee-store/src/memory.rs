//! In-process store and queue used by the test suites and local runs without infrastructure.
//!
//! `MemoryStore` reproduces the row-lock semantics of the Postgres ledger: `lock_entry` waits
//! on a per-row async mutex, writes are staged until commit, and dropping a transaction releases
//! its locks without applying anything.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marquee_core::{
    BrokerError, Delivery, DeliveryTag, IdempotencyRecord, LedgerEntry, LedgerStore,
    LedgerTransaction, MailQueue, MessageHeaders, Seat, SeatInventory, StoreError, Ticket,
    TicketStore,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

const SEAT_POSITION_KEY: &str = "seats_venue_id_seat_row_seat_column_key";
const SEAT_NUMBER_KEY: &str = "seats_venue_id_seat_number_key";
const LEDGER_KEY: &str = "showtime_seats_showtime_id_seat_id_key";
const TRANSACTION_KEY: &str = "tickets_transaction_id_key";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct LedgerRow {
    gate: Arc<AsyncMutex<()>>,
    committed: Mutex<LedgerEntry>,
}

impl LedgerRow {
    fn new(entry: LedgerEntry) -> Self {
        Self {
            gate: Arc::new(AsyncMutex::new(())),
            committed: Mutex::new(entry),
        }
    }

    fn snapshot(&self) -> LedgerEntry {
        lock(&self.committed).clone()
    }
}

type LedgerTable = Mutex<HashMap<(Uuid, Uuid), Arc<LedgerRow>>>;

#[derive(Default)]
struct TicketTables {
    records: HashMap<String, IdempotencyRecord>,
    tickets: HashMap<String, Ticket>,
}

#[derive(Default)]
struct Inner {
    seats: Mutex<Vec<Seat>>,
    ledger: LedgerTable,
    tickets: Mutex<TicketTables>,
    unavailable: AtomicBool,
    silent_ticket_inserts: AtomicBool,
}

impl Inner {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with `StoreError::Unavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes `insert_ticket` report zero rows written without storing anything.
    pub fn set_silent_ticket_inserts(&self, silent: bool) {
        self.inner.silent_ticket_inserts.store(silent, Ordering::SeqCst);
    }

    /// Committed state of one ledger entry.
    pub fn entry(&self, showtime_id: Uuid, seat_id: Uuid) -> Option<LedgerEntry> {
        lock(&self.inner.ledger)
            .get(&(showtime_id, seat_id))
            .map(|row| row.snapshot())
    }

    pub fn tickets(&self) -> Vec<Ticket> {
        lock(&self.inner.tickets).tickets.values().cloned().collect()
    }

    pub fn record(&self, key: &str) -> Option<IdempotencyRecord> {
        lock(&self.inner.tickets).records.get(key).cloned()
    }
}

#[async_trait]
impl SeatInventory for MemoryStore {
    async fn add_seats(&self, seats: &[Seat]) -> Result<u64, StoreError> {
        self.inner.check_available()?;
        let mut stored = lock(&self.inner.seats);

        let mut positions: HashSet<(Uuid, i32, i32)> =
            stored.iter().map(|s| (s.venue_id, s.row, s.column)).collect();
        let mut numbers: HashSet<(Uuid, String)> = stored
            .iter()
            .map(|s| (s.venue_id, s.seat_number.clone()))
            .collect();

        for seat in seats {
            if !positions.insert((seat.venue_id, seat.row, seat.column)) {
                return Err(StoreError::UniqueViolation(SEAT_POSITION_KEY.to_string()));
            }
            if !numbers.insert((seat.venue_id, seat.seat_number.clone())) {
                return Err(StoreError::UniqueViolation(SEAT_NUMBER_KEY.to_string()));
            }
        }

        stored.extend(seats.iter().cloned());
        Ok(seats.len() as u64)
    }

    async fn seats_for_venue(&self, venue_id: Uuid) -> Result<Vec<Seat>, StoreError> {
        self.inner.check_available()?;
        let mut seats: Vec<Seat> = lock(&self.inner.seats)
            .iter()
            .filter(|s| s.venue_id == venue_id)
            .cloned()
            .collect();
        seats.sort_by_key(|s| (s.row, s.column));
        Ok(seats)
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>, StoreError> {
        self.inner.check_available()?;
        Ok(Box::new(MemoryLedgerTransaction {
            inner: self.inner.clone(),
            locked: HashMap::new(),
            inserts: Vec::new(),
        }))
    }

    async fn entries_for_showtime(&self, showtime_id: Uuid) -> Result<Vec<LedgerEntry>, StoreError> {
        self.inner.check_available()?;
        let mut entries: Vec<LedgerEntry> = lock(&self.inner.ledger)
            .iter()
            .filter(|((showtime, _), _)| *showtime == showtime_id)
            .map(|(_, row)| row.snapshot())
            .collect();
        entries.sort_by(|a, b| a.seat_number.cmp(&b.seat_number));
        Ok(entries)
    }

    async fn release_expired_holds(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.check_available()?;
        let rows: Vec<Arc<LedgerRow>> = lock(&self.inner.ledger).values().cloned().collect();

        let mut released = 0;
        for row in rows {
            // Waits behind any transaction holding the row, like the SQL UPDATE does.
            let _gate = row.gate.lock().await;
            let mut entry = lock(&row.committed);
            let elapsed = matches!(entry.hold_expires_at, Some(until) if until <= now);
            if elapsed && !entry.is_finalized() {
                entry.release();
                released += 1;
            }
        }
        Ok(released)
    }
}

struct LockedRow {
    row: Arc<LedgerRow>,
    _guard: OwnedMutexGuard<()>,
    working: LedgerEntry,
}

pub struct MemoryLedgerTransaction {
    inner: Arc<Inner>,
    // Keyed by entry id.
    locked: HashMap<Uuid, LockedRow>,
    inserts: Vec<LedgerEntry>,
}

#[async_trait]
impl LedgerTransaction for MemoryLedgerTransaction {
    async fn lock_entry(&mut self, showtime_id: Uuid, seat_id: Uuid) -> Result<Option<LedgerEntry>, StoreError> {
        self.inner.check_available()?;
        if let Some(held) = self
            .locked
            .values()
            .find(|l| l.working.showtime_id == showtime_id && l.working.seat_id == seat_id)
        {
            return Ok(Some(held.working.clone()));
        }

        let row = match lock(&self.inner.ledger).get(&(showtime_id, seat_id)) {
            Some(row) => row.clone(),
            None => return Ok(None),
        };

        let guard = row.gate.clone().lock_owned().await;
        let working = row.snapshot();
        self.locked.insert(
            working.id,
            LockedRow {
                row,
                _guard: guard,
                working: working.clone(),
            },
        );
        Ok(Some(working))
    }

    async fn update_entry(&mut self, entry: &LedgerEntry) -> Result<u64, StoreError> {
        self.inner.check_available()?;
        match self.locked.get_mut(&entry.id) {
            Some(held) => {
                held.working = entry.clone();
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn insert_entries(&mut self, entries: &[LedgerEntry]) -> Result<u64, StoreError> {
        self.inner.check_available()?;
        let ledger = lock(&self.inner.ledger);
        let mut pending: HashSet<(Uuid, Uuid)> =
            self.inserts.iter().map(|e| (e.showtime_id, e.seat_id)).collect();
        for entry in entries {
            let key = (entry.showtime_id, entry.seat_id);
            if ledger.contains_key(&key) || !pending.insert(key) {
                return Err(StoreError::UniqueViolation(LEDGER_KEY.to_string()));
            }
        }
        drop(ledger);

        self.inserts.extend(entries.iter().cloned());
        Ok(entries.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.check_available()?;
        let MemoryLedgerTransaction { inner, locked, inserts } = *self;

        {
            let mut ledger = lock(&inner.ledger);
            if inserts
                .iter()
                .any(|e| ledger.contains_key(&(e.showtime_id, e.seat_id)))
            {
                return Err(StoreError::UniqueViolation(LEDGER_KEY.to_string()));
            }
            for entry in inserts {
                ledger.insert((entry.showtime_id, entry.seat_id), Arc::new(LedgerRow::new(entry)));
            }
        }

        for held in locked.into_values() {
            *lock(&held.row.committed) = held.working;
        }
        Ok(())
    }
}

#[async_trait]
impl TicketStore for MemoryStore {
    async fn save_idempotency_record(&self, record: &IdempotencyRecord) -> Result<(), StoreError> {
        self.inner.check_available()?;
        let mut tables = lock(&self.inner.tickets);
        let mut record = record.clone();
        if let Some(existing) = tables.records.get(&record.key) {
            record.ticket_issued = existing.ticket_issued;
            record.mail_enqueued = existing.mail_enqueued;
        }
        tables.records.insert(record.key.clone(), record);
        Ok(())
    }

    async fn find_idempotency_record(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.inner.check_available()?;
        Ok(lock(&self.inner.tickets).records.get(key).cloned())
    }

    async fn insert_ticket(&self, ticket: &Ticket) -> Result<u64, StoreError> {
        self.inner.check_available()?;
        if self.inner.silent_ticket_inserts.load(Ordering::SeqCst) {
            return Ok(0);
        }

        let mut tables = lock(&self.inner.tickets);
        if tables.tickets.contains_key(&ticket.transaction_id) {
            return Err(StoreError::UniqueViolation(TRANSACTION_KEY.to_string()));
        }
        match tables.records.get_mut(&ticket.idempotency_key) {
            Some(record) if !record.ticket_issued => record.ticket_issued = true,
            _ => {
                return Err(StoreError::StaleWrite(format!(
                    "idempotency record {} already issued",
                    ticket.idempotency_key
                )))
            }
        }
        tables
            .tickets
            .insert(ticket.transaction_id.clone(), ticket.clone());
        Ok(1)
    }

    async fn mark_mail_enqueued(&self, key: &str) -> Result<(), StoreError> {
        self.inner.check_available()?;
        if let Some(record) = lock(&self.inner.tickets).records.get_mut(key) {
            record.mail_enqueued = true;
        }
        Ok(())
    }

    async fn find_ticket(&self, transaction_id: &str) -> Result<Option<Ticket>, StoreError> {
        self.inner.check_available()?;
        Ok(lock(&self.inner.tickets).tickets.get(transaction_id).cloned())
    }
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<String, VecDeque<Delivery>>,
    next_offset: i64,
    in_flight: HashMap<DeliveryTag, Delivery>,
    acked: Vec<DeliveryTag>,
    nacked: Vec<(DeliveryTag, bool)>,
    failing: HashSet<String>,
}

/// Broker double. `receive` drains the work queue and returns `None` once it is empty.
pub struct MemoryMailQueue {
    work_queue: String,
    state: Mutex<QueueState>,
}

impl MemoryMailQueue {
    pub fn new(work_queue: &str) -> Self {
        Self {
            work_queue: work_queue.to_string(),
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Enqueues a message on the work queue as an external producer would.
    pub fn push(&self, body: &[u8], headers: MessageHeaders) -> DeliveryTag {
        let queue = self.work_queue.clone();
        enqueue(&mut lock(&self.state), &queue, body, headers)
    }

    /// Messages currently sitting on `queue`, oldest first.
    pub fn messages(&self, queue: &str) -> Vec<Delivery> {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn acked(&self) -> Vec<DeliveryTag> {
        lock(&self.state).acked.clone()
    }

    pub fn nacked(&self) -> Vec<(DeliveryTag, bool)> {
        lock(&self.state).nacked.clone()
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.state).in_flight.len()
    }

    pub fn fail_publishes_to(&self, queue: &str) {
        lock(&self.state).failing.insert(queue.to_string());
    }

    pub fn allow_publishes_to(&self, queue: &str) {
        lock(&self.state).failing.remove(queue);
    }

    fn settle(&self, delivery: &Delivery) -> Result<(MutexGuard<'_, QueueState>, Delivery), BrokerError> {
        let mut state = lock(&self.state);
        match state.in_flight.remove(&delivery.tag) {
            Some(original) => Ok((state, original)),
            None => Err(BrokerError::UnknownDelivery(delivery.tag.to_string())),
        }
    }
}

fn enqueue(state: &mut QueueState, queue: &str, body: &[u8], headers: MessageHeaders) -> DeliveryTag {
    let tag = DeliveryTag {
        queue: queue.to_string(),
        partition: 0,
        offset: state.next_offset,
    };
    state.next_offset += 1;
    state
        .queues
        .entry(queue.to_string())
        .or_default()
        .push_back(Delivery {
            tag: tag.clone(),
            body: body.to_vec(),
            headers,
        });
    tag
}

#[async_trait]
impl MailQueue for MemoryMailQueue {
    async fn receive(&self) -> Result<Option<Delivery>, BrokerError> {
        let mut state = lock(&self.state);
        let next = state
            .queues
            .get_mut(&self.work_queue)
            .and_then(VecDeque::pop_front);
        if let Some(delivery) = &next {
            state.in_flight.insert(delivery.tag.clone(), delivery.clone());
        }
        Ok(next)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let (mut state, original) = self.settle(delivery)?;
        state.acked.push(original.tag);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        let (mut state, original) = self.settle(delivery)?;
        state.nacked.push((original.tag.clone(), requeue));
        if requeue {
            state
                .queues
                .entry(original.tag.queue.clone())
                .or_default()
                .push_front(original);
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8], headers: &MessageHeaders) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        if state.failing.contains(queue) {
            return Err(BrokerError::PublishFailed {
                queue: queue.to_string(),
                reason: "publishing disabled".to_string(),
            });
        }
        enqueue(&mut state, queue, body, headers.clone());
        Ok(())
    }
}
