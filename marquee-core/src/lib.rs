pub mod clock;
pub mod error;
pub mod mail;
pub mod models;
pub mod pii;
pub mod repository;
pub mod validation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BookingError, BrokerError, ErrorKind, StoreError};
pub use mail::{Delivery, DeliveryTag, MalformedPolicy, MessageHeaders, OutboundMailRequest, RETRY_COUNT_HEADER};
pub use models::{
    BookingConfirmation, ContactInfo, HoldReceipt, IdempotencyRecord, LedgerEntry, NewSeat,
    PaymentStatus, Seat, SeatAvailability, SeatState, Ticket,
};
pub use pii::Masked;
pub use repository::{LedgerStore, LedgerTransaction, MailQueue, SeatInventory, TicketStore};
pub use validation::ContactValidator;

pub type BookingResult<T> = Result<T, BookingError>;
