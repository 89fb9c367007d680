use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marquee_core::{IdempotencyRecord, Masked, PaymentStatus, StoreError, Ticket, TicketStore};
use sqlx::PgPool;
use uuid::Uuid;

use crate::database::map_sqlx_error;

#[derive(sqlx::FromRow)]
struct IdempotencyRow {
    key: String,
    payment_id: String,
    customer_id: String,
    customer_email: Option<String>,
    showtime_id: Uuid,
    ledger_entry_ids: Vec<Uuid>,
    payment_status: String,
    expires_at: DateTime<Utc>,
    ticket_issued: bool,
    mail_enqueued: bool,
}

impl TryFrom<IdempotencyRow> for IdempotencyRecord {
    type Error = StoreError;

    fn try_from(row: IdempotencyRow) -> Result<Self, Self::Error> {
        let payment_status = row
            .payment_status
            .parse::<PaymentStatus>()
            .map_err(StoreError::Corrupt)?;

        Ok(Self {
            key: row.key,
            payment_id: row.payment_id,
            customer_id: row.customer_id,
            customer_email: row.customer_email.map(Masked::new),
            showtime_id: row.showtime_id,
            ledger_entry_ids: row.ledger_entry_ids,
            payment_status,
            expires_at: row.expires_at,
            ticket_issued: row.ticket_issued,
            mail_enqueued: row.mail_enqueued,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TicketRow {
    id: Uuid,
    transaction_id: String,
    idempotency_key: String,
    customer_id: String,
    showtime_id: Uuid,
    ledger_entry_ids: Vec<Uuid>,
    issued_at: DateTime<Utc>,
}

impl From<TicketRow> for Ticket {
    fn from(row: TicketRow) -> Self {
        Self {
            id: row.id,
            transaction_id: row.transaction_id,
            idempotency_key: row.idempotency_key,
            customer_id: row.customer_id,
            showtime_id: row.showtime_id,
            ledger_entry_ids: row.ledger_entry_ids,
            issued_at: row.issued_at,
        }
    }
}

#[derive(Clone)]
pub struct PgTicketStore {
    pool: PgPool,
}

impl PgTicketStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TicketStore for PgTicketStore {
    async fn save_idempotency_record(&self, record: &IdempotencyRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO idempotency_records
                (key, payment_id, customer_id, customer_email, showtime_id, ledger_entry_ids,
                 payment_status, expires_at, ticket_issued, mail_enqueued)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (key) DO UPDATE SET
                payment_id = EXCLUDED.payment_id,
                customer_id = EXCLUDED.customer_id,
                customer_email = EXCLUDED.customer_email,
                showtime_id = EXCLUDED.showtime_id,
                ledger_entry_ids = EXCLUDED.ledger_entry_ids,
                payment_status = EXCLUDED.payment_status,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&record.key)
        .bind(&record.payment_id)
        .bind(&record.customer_id)
        .bind(record.customer_email.as_ref().map(|e| e.expose().as_str()))
        .bind(record.showtime_id)
        .bind(&record.ledger_entry_ids)
        .bind(record.payment_status.as_str())
        .bind(record.expires_at)
        .bind(record.ticket_issued)
        .bind(record.mail_enqueued)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn find_idempotency_record(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let row = sqlx::query_as::<_, IdempotencyRow>(
            r#"
            SELECT key, payment_id, customer_id, customer_email, showtime_id, ledger_entry_ids,
                   payment_status, expires_at, ticket_issued, mail_enqueued
            FROM idempotency_records
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(IdempotencyRecord::try_from).transpose()
    }

    async fn insert_ticket(&self, ticket: &Ticket) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO tickets
                (id, transaction_id, idempotency_key, customer_id, showtime_id, ledger_entry_ids, issued_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(ticket.id)
        .bind(&ticket.transaction_id)
        .bind(&ticket.idempotency_key)
        .bind(&ticket.customer_id)
        .bind(ticket.showtime_id)
        .bind(&ticket.ledger_entry_ids)
        .bind(ticket.issued_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?
        .rows_affected();

        if inserted == 0 {
            return Ok(0);
        }

        let flipped = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET ticket_issued = TRUE
            WHERE key = $1 AND ticket_issued = FALSE
            "#,
        )
        .bind(&ticket.idempotency_key)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?
        .rows_affected();

        // Dropping `tx` here rolls the ticket row back.
        if flipped == 0 {
            return Err(StoreError::StaleWrite(format!(
                "idempotency record {} already issued",
                ticket.idempotency_key
            )));
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(inserted)
    }

    async fn mark_mail_enqueued(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE idempotency_records SET mail_enqueued = TRUE WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn find_ticket(&self, transaction_id: &str) -> Result<Option<Ticket>, StoreError> {
        let row = sqlx::query_as::<_, TicketRow>(
            r#"
            SELECT id, transaction_id, idempotency_key, customer_id, showtime_id, ledger_entry_ids, issued_at
            FROM tickets
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(Ticket::from))
    }
}
