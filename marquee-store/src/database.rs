use marquee_core::StoreError;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::info;

use crate::app_config::DatabaseConfig;
use crate::{PgLedgerStore, PgSeatInventory, PgTicketStore};

#[derive(Clone)]
pub struct DbClient {
    pub pool: Pool<Postgres>,
}

impl DbClient {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await?;
        info!("Migrations completed successfully.");
        Ok(())
    }

    pub fn ledger_store(&self) -> PgLedgerStore {
        PgLedgerStore::new(self.pool.clone())
    }

    pub fn seat_inventory(&self) -> PgSeatInventory {
        PgSeatInventory::new(self.pool.clone())
    }

    pub fn ticket_store(&self) -> PgTicketStore {
        PgTicketStore::new(self.pool.clone())
    }
}

/// Maps driver errors onto the store taxonomy. SQLSTATE 23505 becomes `UniqueViolation`
/// carrying the constraint name.
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::UniqueViolation(db.constraint().unwrap_or(db.message()).to_string());
        }
    }
    let message = err.to_string();
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Corrupt(message)
        }
        _ => StoreError::Unavailable(message),
    }
}
