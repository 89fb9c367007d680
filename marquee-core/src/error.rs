use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::PaymentStatus;

/// Coarse classification of a failure, used by collaborators to choose between
/// fixing the request, picking other seats, or retrying later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Transient,
    Fatal,
}

/// Failures raised by a relational store implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// A guarded write (`... WHERE flag = FALSE`) matched no rows.
    #[error("Guarded write matched no rows: {0}")]
    StaleWrite(String),

    #[error("Stored data could not be decoded: {0}")]
    Corrupt(String),
}

/// Failures raised by a message broker implementation.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Publish to {queue} failed: {reason}")]
    PublishFailed { queue: String, reason: String },

    #[error("Unknown or already settled delivery: {0}")]
    UnknownDelivery(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("Invalid contact: {0}")]
    InvalidContact(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Venue {0} has no seats")]
    VenueHasNoSeats(Uuid),

    #[error("Seat {seat_id} not found for showtime {showtime_id}")]
    SeatNotFound { showtime_id: Uuid, seat_id: Uuid },

    #[error("Seat {seat_number} already booked")]
    SeatAlreadyBooked { seat_id: Uuid, seat_number: String },

    #[error("Seat {seat_number} is locked until {until}")]
    SeatLocked {
        seat_id: Uuid,
        seat_number: String,
        until: DateTime<Utc>,
    },

    #[error("Seat conflicts with existing inventory: {0}")]
    SeatConflict(String),

    #[error("Showtime {0} already has a seat ledger")]
    ShowtimeAlreadyOpened(Uuid),

    #[error("Unknown idempotency key: {0}")]
    UnknownIdempotencyKey(String),

    #[error("Payment for idempotency key {key} is {status}")]
    PaymentNotCompleted { key: String, status: PaymentStatus },

    #[error("Transaction {0} already has a ticket")]
    DuplicateTransaction(String),

    #[error("Ticket already issued for idempotency key {0}")]
    TicketAlreadyIssued(String),

    #[error("Ticket insert for transaction {0} wrote no rows")]
    TicketInsertFailed(String),

    #[error("Ledger write for entry {0} affected no rows")]
    LedgerWriteFailed(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BookingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BookingError::InvalidContact(_)
            | BookingError::InvalidRequest(_)
            | BookingError::VenueHasNoSeats(_)
            | BookingError::SeatNotFound { .. }
            | BookingError::UnknownIdempotencyKey(_) => ErrorKind::Validation,
            BookingError::SeatAlreadyBooked { .. }
            | BookingError::SeatLocked { .. }
            | BookingError::SeatConflict(_)
            | BookingError::ShowtimeAlreadyOpened(_)
            | BookingError::PaymentNotCompleted { .. }
            | BookingError::DuplicateTransaction(_)
            | BookingError::TicketAlreadyIssued(_) => ErrorKind::Conflict,
            BookingError::TicketInsertFailed(_) | BookingError::LedgerWriteFailed(_) => {
                ErrorKind::Fatal
            }
            BookingError::Store(StoreError::UniqueViolation(_))
            | BookingError::Store(StoreError::StaleWrite(_)) => ErrorKind::Conflict,
            BookingError::Store(StoreError::Corrupt(_)) => ErrorKind::Fatal,
            BookingError::Store(StoreError::Unavailable(_)) => ErrorKind::Transient,
        }
    }

    /// True when the caller has to change the request; false when the failure is on our side.
    pub fn is_client_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::Validation | ErrorKind::Conflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let locked = BookingError::SeatLocked {
            seat_id: Uuid::new_v4(),
            seat_number: "A1".to_string(),
            until: Utc::now(),
        };
        assert_eq!(locked.kind(), ErrorKind::Conflict);
        assert!(locked.is_client_error());

        let down = BookingError::from(StoreError::Unavailable("pool timed out".to_string()));
        assert_eq!(down.kind(), ErrorKind::Transient);
        assert!(!down.is_client_error());

        let fatal = BookingError::TicketInsertFailed("txn-1".to_string());
        assert_eq!(fatal.kind(), ErrorKind::Fatal);
        assert!(!fatal.is_client_error());

        assert_eq!(
            BookingError::InvalidContact("bad phone".to_string()).kind(),
            ErrorKind::Validation
        );
    }
}
