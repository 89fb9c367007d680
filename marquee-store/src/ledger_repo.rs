use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marquee_core::{LedgerEntry, LedgerStore, LedgerTransaction, Masked, StoreError};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::database::map_sqlx_error;

// Keeps a single INSERT well under the 65535 bind parameter limit.
const INSERT_CHUNK: usize = 1000;

#[derive(sqlx::FromRow)]
struct LedgerRow {
    id: Uuid,
    showtime_id: Uuid,
    seat_id: Uuid,
    seat_number: String,
    is_booked: bool,
    email: Option<String>,
    phone_number: Option<String>,
    hold_expires_at: Option<DateTime<Utc>>,
}

impl From<LedgerRow> for LedgerEntry {
    fn from(row: LedgerRow) -> Self {
        Self {
            id: row.id,
            showtime_id: row.showtime_id,
            seat_id: row.seat_id,
            seat_number: row.seat_number,
            is_booked: row.is_booked,
            email: row.email.map(Masked::new),
            phone_number: row.phone_number.map(Masked::new),
            hold_expires_at: row.hold_expires_at,
        }
    }
}

#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>, StoreError> {
        let tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        Ok(Box::new(PgLedgerTransaction { tx }))
    }

    async fn entries_for_showtime(&self, showtime_id: Uuid) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query_as::<_, LedgerRow>(
            r#"
            SELECT id, showtime_id, seat_id, seat_number, is_booked, email, phone_number, hold_expires_at
            FROM showtime_seats
            WHERE showtime_id = $1
            ORDER BY seat_number
            "#,
        )
        .bind(showtime_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(LedgerEntry::from).collect())
    }

    async fn release_expired_holds(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE showtime_seats
            SET is_booked = FALSE, hold_expires_at = NULL, updated_at = NOW()
            WHERE hold_expires_at IS NOT NULL
              AND hold_expires_at <= $1
              AND email IS NULL
              AND phone_number IS NULL
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }
}

/// Wraps a sqlx transaction, which rolls back when dropped uncommitted.
pub struct PgLedgerTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTransaction for PgLedgerTransaction {
    async fn lock_entry(&mut self, showtime_id: Uuid, seat_id: Uuid) -> Result<Option<LedgerEntry>, StoreError> {
        let row = sqlx::query_as::<_, LedgerRow>(
            r#"
            SELECT id, showtime_id, seat_id, seat_number, is_booked, email, phone_number, hold_expires_at
            FROM showtime_seats
            WHERE showtime_id = $1 AND seat_id = $2
            FOR UPDATE
            "#,
        )
        .bind(showtime_id)
        .bind(seat_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(LedgerEntry::from))
    }

    async fn update_entry(&mut self, entry: &LedgerEntry) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE showtime_seats
            SET is_booked = $2, email = $3, phone_number = $4, hold_expires_at = $5, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(entry.id)
        .bind(entry.is_booked)
        .bind(entry.email.as_ref().map(|e| e.expose().as_str()))
        .bind(entry.phone_number.as_ref().map(|p| p.expose().as_str()))
        .bind(entry.hold_expires_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }

    async fn insert_entries(&mut self, entries: &[LedgerEntry]) -> Result<u64, StoreError> {
        let mut inserted = 0;
        for chunk in entries.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO showtime_seats (id, showtime_id, seat_id, seat_number, is_booked, hold_expires_at) ",
            );
            builder.push_values(chunk, |mut row, entry| {
                row.push_bind(entry.id)
                    .push_bind(entry.showtime_id)
                    .push_bind(entry.seat_id)
                    .push_bind(entry.seat_number.clone())
                    .push_bind(entry.is_booked)
                    .push_bind(entry.hold_expires_at);
            });
            let result = builder
                .build()
                .execute(&mut *self.tx)
                .await
                .map_err(map_sqlx_error)?;
            inserted += result.rows_affected();
        }
        debug!("Inserted {} ledger entries", inserted);
        Ok(inserted)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let PgLedgerTransaction { tx } = *self;
        tx.commit().await.map_err(map_sqlx_error)
    }
}
