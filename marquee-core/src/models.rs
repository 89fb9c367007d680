use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::pii::Masked;

/// A physical seat of a venue. Reference data owned by venue management.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Seat {
    pub id: Uuid,
    pub venue_id: Uuid,
    pub seat_number: String,
    pub row: i32,
    pub column: i32,
    pub price: i64,
    pub category: String,
}

/// Seat definition as submitted for registration, before it has an identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSeat {
    pub seat_number: String,
    pub row: i32,
    pub column: i32,
    pub price: i64,
    #[serde(default = "default_category")]
    pub category: String,
}

fn default_category() -> String {
    "STANDARD".to_string()
}

impl Seat {
    pub fn from_new(venue_id: Uuid, seat: NewSeat) -> Self {
        Self {
            id: Uuid::new_v4(),
            venue_id,
            seat_number: seat.seat_number,
            row: seat.row,
            column: seat.column,
            price: seat.price,
            category: seat.category,
        }
    }
}

/// Validated customer contact attached to a finalized booking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactInfo {
    pub email: Masked<String>,
    pub phone_number: Masked<String>,
}

impl ContactInfo {
    pub fn email(&self) -> &str {
        self.email.expose()
    }

    pub fn phone_number(&self) -> &str {
        self.phone_number.expose()
    }
}

/// Derived availability of a ledger entry at a given instant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatState {
    Free,
    Held { until: DateTime<Utc> },
    Booked,
}

/// Booking state of one seat for one showtime. The unit of contention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub showtime_id: Uuid,
    pub seat_id: Uuid,
    pub seat_number: String,
    pub is_booked: bool,
    pub email: Option<Masked<String>>,
    pub phone_number: Option<Masked<String>>,
    pub hold_expires_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    /// A `free` entry for `seat` under `showtime_id`, as created by showtime fan-out.
    pub fn fresh(showtime_id: Uuid, seat: &Seat) -> Self {
        Self {
            id: Uuid::new_v4(),
            showtime_id,
            seat_id: seat.id,
            seat_number: seat.seat_number.clone(),
            is_booked: false,
            email: None,
            phone_number: None,
            hold_expires_at: None,
        }
    }

    /// A hold also raises `is_booked`, so a sale is recognised by its contact fields.
    pub fn is_finalized(&self) -> bool {
        self.email.is_some() || self.phone_number.is_some()
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> SeatState {
        if self.is_finalized() {
            return SeatState::Booked;
        }
        match self.hold_expires_at {
            Some(until) if until > now => SeatState::Held { until },
            // An elapsed hold counts as never placed.
            Some(_) => SeatState::Free,
            None if self.is_booked => SeatState::Booked,
            None => SeatState::Free,
        }
    }

    pub fn place_hold(&mut self, until: DateTime<Utc>) {
        self.is_booked = true;
        self.hold_expires_at = Some(until);
    }

    pub fn release(&mut self) {
        self.is_booked = false;
        self.hold_expires_at = None;
    }

    pub fn finalize(&mut self, contact: &ContactInfo) {
        self.is_booked = true;
        self.email = Some(contact.email.clone());
        self.phone_number = Some(contact.phone_number.clone());
        self.hold_expires_at = None;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeatAvailability {
    pub entry_id: Uuid,
    pub seat_id: Uuid,
    pub seat_number: String,
    #[serde(flatten)]
    pub state: SeatState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HoldReceipt {
    pub showtime_id: Uuid,
    pub seat_ids: Vec<Uuid>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookingConfirmation {
    pub showtime_id: Uuid,
    pub entry_ids: Vec<Uuid>,
    pub seat_numbers: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Succeeded => "SUCCEEDED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(PaymentStatus::Pending),
            "SUCCEEDED" => Ok(PaymentStatus::Succeeded),
            "FAILED" => Ok(PaymentStatus::Failed),
            "REFUNDED" => Ok(PaymentStatus::Refunded),
            other => Err(format!("unknown payment status {}", other)),
        }
    }
}

/// Written by the payment collaborator before it asks for a ticket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub payment_id: String,
    pub customer_id: String,
    pub customer_email: Option<Masked<String>>,
    pub showtime_id: Uuid,
    pub ledger_entry_ids: Vec<Uuid>,
    pub payment_status: PaymentStatus,
    pub expires_at: DateTime<Utc>,
    pub ticket_issued: bool,
    pub mail_enqueued: bool,
}

/// Booking confirmation bound 1:1 to a payment transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ticket {
    pub id: Uuid,
    pub transaction_id: String,
    pub idempotency_key: String,
    pub customer_id: String,
    pub showtime_id: Uuid,
    pub ledger_entry_ids: Vec<Uuid>,
    pub issued_at: DateTime<Utc>,
}

impl Ticket {
    pub fn for_record(record: &IdempotencyRecord, transaction_id: &str, issued_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id: transaction_id.to_string(),
            idempotency_key: record.key.clone(),
            customer_id: record.customer_id.clone(),
            showtime_id: record.showtime_id,
            ledger_entry_ids: record.ledger_entry_ids.clone(),
            issued_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry() -> LedgerEntry {
        let seat = Seat::from_new(
            Uuid::new_v4(),
            NewSeat {
                seat_number: "A1".to_string(),
                row: 1,
                column: 1,
                price: 1200,
                category: "STANDARD".to_string(),
            },
        );
        LedgerEntry::fresh(Uuid::new_v4(), &seat)
    }

    #[test]
    fn test_entry_lifecycle_states() {
        let now = Utc::now();
        let mut entry = entry();
        assert_eq!(entry.state_at(now), SeatState::Free);

        // free -> held
        let until = now + Duration::minutes(15);
        entry.place_hold(until);
        assert_eq!(entry.state_at(now), SeatState::Held { until });

        // held -> free, lazily, once the hold has elapsed
        assert_eq!(entry.state_at(until + Duration::seconds(1)), SeatState::Free);
        // the expiry instant itself is no longer held
        assert_eq!(entry.state_at(until), SeatState::Free);

        // held -> booked
        entry.finalize(&ContactInfo {
            email: Masked::new("jane@example.com".to_string()),
            phone_number: Masked::new("4155550100".to_string()),
        });
        assert!(entry.is_finalized());
        assert_eq!(entry.state_at(now), SeatState::Booked);
        assert!(entry.hold_expires_at.is_none());
    }

    #[test]
    fn test_flag_without_hold_reads_as_booked() {
        let mut entry = entry();
        entry.is_booked = true;
        assert_eq!(entry.state_at(Utc::now()), SeatState::Booked);
    }

    #[test]
    fn test_payment_status_round_trip() {
        assert_eq!("succeeded".parse::<PaymentStatus>().unwrap(), PaymentStatus::Succeeded);
        assert_eq!(PaymentStatus::Refunded.to_string(), "REFUNDED");
        assert!("settled".parse::<PaymentStatus>().is_err());
    }
}
