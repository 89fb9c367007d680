pub mod committer;
pub mod holds;
pub mod ledger;
pub mod reaper;
pub mod tickets;

pub use committer::BookingCommitter;
pub use holds::HoldManager;
pub use ledger::ShowtimeLedger;
pub use reaper::HoldReaper;
pub use tickets::TicketIssuer;

#[cfg(test)]
pub(crate) mod testing;
