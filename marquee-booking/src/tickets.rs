use marquee_core::{
    BookingError, BookingResult, Clock, IdempotencyRecord, MailQueue, MessageHeaders,
    OutboundMailRequest, PaymentStatus, StoreError, Ticket, TicketStore,
};
use std::sync::Arc;
use tracing::{error, info, warn};

const CONFIRMATION_SUBJECT: &str = "Your tickets are confirmed";
const CONFIRMATION_CATEGORY: &str = "Booking Confirmation";

/// Converts a completed payment into exactly one ticket.
pub struct TicketIssuer {
    store: Arc<dyn TicketStore>,
    clock: Arc<dyn Clock>,
    confirmations: Option<(Arc<dyn MailQueue>, String)>,
}

impl TicketIssuer {
    pub fn new(store: Arc<dyn TicketStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            confirmations: None,
        }
    }

    /// Publishes a confirmation mail to `queue` after each issued ticket.
    pub fn with_confirmations(mut self, broker: Arc<dyn MailQueue>, queue: &str) -> Self {
        self.confirmations = Some((broker, queue.to_string()));
        self
    }

    /// Issues the ticket authorized by `idempotency_key`, tagged with `transaction_id`.
    ///
    /// A retried call with the same transaction id fails with `DuplicateTransaction`; a second
    /// transaction id against an already issued key fails with `TicketAlreadyIssued`.
    pub async fn issue_ticket(&self, idempotency_key: &str, transaction_id: &str) -> BookingResult<Ticket> {
        if idempotency_key.trim().is_empty() || transaction_id.trim().is_empty() {
            return Err(BookingError::InvalidRequest(
                "idempotency key and transaction id are required".to_string(),
            ));
        }

        // 1. Resolve the record written by the payment flow
        let record = self
            .store
            .find_idempotency_record(idempotency_key)
            .await?
            .ok_or_else(|| BookingError::UnknownIdempotencyKey(idempotency_key.to_string()))?;

        if record.payment_status != PaymentStatus::Succeeded {
            return Err(BookingError::PaymentNotCompleted {
                key: record.key.clone(),
                status: record.payment_status,
            });
        }

        // 2. Insert; the store enforces transaction uniqueness and the single issued flip
        let ticket = Ticket::for_record(&record, transaction_id, self.clock.now());
        let written = match self.store.insert_ticket(&ticket).await {
            Ok(n) => n,
            Err(StoreError::UniqueViolation(_)) => {
                warn!("Transaction {} already has a ticket", transaction_id);
                return Err(BookingError::DuplicateTransaction(transaction_id.to_string()));
            }
            Err(StoreError::StaleWrite(_)) => {
                warn!("Idempotency key {} was already used to issue a ticket", idempotency_key);
                return Err(BookingError::TicketAlreadyIssued(idempotency_key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if written == 0 {
            error!("Ticket insert for transaction {} wrote no rows", transaction_id);
            return Err(BookingError::TicketInsertFailed(transaction_id.to_string()));
        }

        info!(
            "Issued ticket {} for transaction {} covering {} seats of showtime {}",
            ticket.id,
            transaction_id,
            ticket.ledger_entry_ids.len(),
            ticket.showtime_id
        );

        // 3. Best effort; the ticket stands even if this fails
        self.enqueue_confirmation(&record, &ticket).await;
        Ok(ticket)
    }

    async fn enqueue_confirmation(&self, record: &IdempotencyRecord, ticket: &Ticket) {
        let Some((broker, queue)) = &self.confirmations else {
            return;
        };
        let Some(email) = &record.customer_email else {
            return;
        };

        let body = format!(
            "Thank you for your purchase.\n\nTicket: {}\nTransaction: {}\nShowtime: {}\nSeats: {}\n",
            ticket.id,
            ticket.transaction_id,
            ticket.showtime_id,
            ticket.ledger_entry_ids.len()
        );
        let request = OutboundMailRequest::text(email.expose(), CONFIRMATION_SUBJECT, &body, CONFIRMATION_CATEGORY);

        let payload = match serde_json::to_vec(&request) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to encode confirmation for ticket {}: {}", ticket.id, e);
                return;
            }
        };

        if let Err(e) = broker.publish(queue, &payload, &MessageHeaders::new()).await {
            error!("Failed to enqueue confirmation for ticket {}: {}", ticket.id, e);
            return;
        }
        if let Err(e) = self.store.mark_mail_enqueued(&record.key).await {
            warn!("Confirmation for ticket {} enqueued but not recorded: {}", ticket.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use marquee_core::{ErrorKind, Masked, SystemClock};
    use marquee_store::{MemoryMailQueue, MemoryStore};
    use uuid::Uuid;

    const MAIL_QUEUE: &str = "send_mail_queue";

    fn record(key: &str, status: PaymentStatus) -> IdempotencyRecord {
        IdempotencyRecord {
            key: key.to_string(),
            payment_id: "pi_123".to_string(),
            customer_id: "cust_42".to_string(),
            customer_email: Some(Masked::new("ada@example.com".to_string())),
            showtime_id: Uuid::new_v4(),
            ledger_entry_ids: vec![Uuid::new_v4(), Uuid::new_v4()],
            payment_status: status,
            expires_at: Utc::now() + Duration::minutes(30),
            ticket_issued: false,
            mail_enqueued: false,
        }
    }

    async fn issuer_with(store: &MemoryStore, rec: IdempotencyRecord) -> TicketIssuer {
        store.save_idempotency_record(&rec).await.unwrap();
        TicketIssuer::new(Arc::new(store.clone()), Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_issue_ticket_copies_record() {
        let store = MemoryStore::new();
        let rec = record("idem-1", PaymentStatus::Succeeded);
        let issuer = issuer_with(&store, rec.clone()).await;

        let ticket = issuer.issue_ticket("idem-1", "txn-1").await.unwrap();
        assert_eq!(ticket.transaction_id, "txn-1");
        assert_eq!(ticket.customer_id, rec.customer_id);
        assert_eq!(ticket.ledger_entry_ids, rec.ledger_entry_ids);
        assert!(store.record("idem-1").unwrap().ticket_issued);
    }

    #[tokio::test]
    async fn test_retried_confirmation_does_not_duplicate() {
        let store = MemoryStore::new();
        let issuer = issuer_with(&store, record("idem-1", PaymentStatus::Succeeded)).await;

        issuer.issue_ticket("idem-1", "txn-1").await.unwrap();
        let err = issuer.issue_ticket("idem-1", "txn-1").await.unwrap_err();
        assert!(matches!(err, BookingError::DuplicateTransaction(ref t) if t == "txn-1"));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(store.tickets().len(), 1);
    }

    #[tokio::test]
    async fn test_second_transaction_for_same_key() {
        let store = MemoryStore::new();
        let issuer = issuer_with(&store, record("idem-1", PaymentStatus::Succeeded)).await;

        issuer.issue_ticket("idem-1", "txn-1").await.unwrap();
        let err = issuer.issue_ticket("idem-1", "txn-2").await.unwrap_err();
        assert!(matches!(err, BookingError::TicketAlreadyIssued(_)));
        assert!(store.find_ticket("txn-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_key() {
        let store = MemoryStore::new();
        let issuer = TicketIssuer::new(Arc::new(store.clone()), Arc::new(SystemClock));
        let err = issuer.issue_ticket("missing", "txn-1").await.unwrap_err();
        assert!(matches!(err, BookingError::UnknownIdempotencyKey(_)));
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn test_pending_payment_is_refused() {
        let store = MemoryStore::new();
        let issuer = issuer_with(&store, record("idem-1", PaymentStatus::Pending)).await;
        let err = issuer.issue_ticket("idem-1", "txn-1").await.unwrap_err();
        assert!(matches!(err, BookingError::PaymentNotCompleted { status: PaymentStatus::Pending, .. }));
        assert!(store.tickets().is_empty());
    }

    #[tokio::test]
    async fn test_zero_rows_is_fatal() {
        let store = MemoryStore::new();
        let issuer = issuer_with(&store, record("idem-1", PaymentStatus::Succeeded)).await;
        store.set_silent_ticket_inserts(true);

        let err = issuer.issue_ticket("idem-1", "txn-1").await.unwrap_err();
        assert!(matches!(err, BookingError::TicketInsertFailed(_)));
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[tokio::test]
    async fn test_store_outage_is_transient() {
        let store = MemoryStore::new();
        let issuer = issuer_with(&store, record("idem-1", PaymentStatus::Succeeded)).await;
        store.set_unavailable(true);

        let err = issuer.issue_ticket("idem-1", "txn-1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(!err.is_client_error());
    }

    #[tokio::test]
    async fn test_confirmation_is_enqueued() {
        let store = MemoryStore::new();
        let queue = Arc::new(MemoryMailQueue::new(MAIL_QUEUE));
        let issuer = issuer_with(&store, record("idem-1", PaymentStatus::Succeeded))
            .await
            .with_confirmations(queue.clone(), MAIL_QUEUE);

        issuer.issue_ticket("idem-1", "txn-1").await.unwrap();

        let queued = queue.messages(MAIL_QUEUE);
        assert_eq!(queued.len(), 1);
        let mail: OutboundMailRequest = serde_json::from_slice(&queued[0].body).unwrap();
        assert_eq!(mail.to, "ada@example.com");
        assert!(mail.text_body().unwrap().contains("txn-1"));
        assert!(store.record("idem-1").unwrap().mail_enqueued);
    }

    #[tokio::test]
    async fn test_confirmation_failure_keeps_ticket() {
        let store = MemoryStore::new();
        let queue = Arc::new(MemoryMailQueue::new(MAIL_QUEUE));
        queue.fail_publishes_to(MAIL_QUEUE);
        let issuer = issuer_with(&store, record("idem-1", PaymentStatus::Succeeded))
            .await
            .with_confirmations(queue.clone(), MAIL_QUEUE);

        issuer.issue_ticket("idem-1", "txn-1").await.unwrap();
        assert_eq!(store.tickets().len(), 1);
        assert!(!store.record("idem-1").unwrap().mail_enqueued);
    }
}
