pub mod app_config;
pub mod database;
pub mod events;
pub mod ledger_repo;
pub mod memory;
pub mod seat_repo;
pub mod ticket_repo;

pub use database::DbClient;
pub use events::KafkaMailQueue;
pub use ledger_repo::PgLedgerStore;
pub use memory::{MemoryMailQueue, MemoryStore};
pub use seat_repo::PgSeatInventory;
pub use ticket_repo::PgTicketStore;
