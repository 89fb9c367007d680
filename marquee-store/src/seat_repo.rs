use async_trait::async_trait;
use marquee_core::{Seat, SeatInventory, StoreError};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::database::map_sqlx_error;

// 7 binds per seat; keeps a single INSERT under the 65535 parameter limit.
const INSERT_CHUNK: usize = 1000;

#[derive(sqlx::FromRow)]
struct SeatRow {
    id: Uuid,
    venue_id: Uuid,
    seat_number: String,
    seat_row: i32,
    seat_column: i32,
    price: i64,
    category: String,
}

impl From<SeatRow> for Seat {
    fn from(row: SeatRow) -> Self {
        Self {
            id: row.id,
            venue_id: row.venue_id,
            seat_number: row.seat_number,
            row: row.seat_row,
            column: row.seat_column,
            price: row.price,
            category: row.category,
        }
    }
}

#[derive(Clone)]
pub struct PgSeatInventory {
    pool: PgPool,
}

impl PgSeatInventory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SeatInventory for PgSeatInventory {
    async fn add_seats(&self, seats: &[Seat]) -> Result<u64, StoreError> {
        if seats.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut inserted = 0;
        for chunk in seats.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO seats (id, venue_id, seat_number, seat_row, seat_column, price, category) ",
            );
            builder.push_values(chunk, |mut row, seat| {
                row.push_bind(seat.id)
                    .push_bind(seat.venue_id)
                    .push_bind(seat.seat_number.clone())
                    .push_bind(seat.row)
                    .push_bind(seat.column)
                    .push_bind(seat.price)
                    .push_bind(seat.category.clone());
            });
            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
            inserted += result.rows_affected();
        }
        tx.commit().await.map_err(map_sqlx_error)?;

        Ok(inserted)
    }

    async fn seats_for_venue(&self, venue_id: Uuid) -> Result<Vec<Seat>, StoreError> {
        let rows = sqlx::query_as::<_, SeatRow>(
            r#"
            SELECT id, venue_id, seat_number, seat_row, seat_column, price, category
            FROM seats
            WHERE venue_id = $1
            ORDER BY seat_row, seat_column
            "#,
        )
        .bind(venue_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(Seat::from).collect())
    }
}
