use futures_util::FutureExt;
use marquee_core::{BrokerError, Delivery, MailQueue, MalformedPolicy, OutboundMailRequest};
use marquee_store::app_config::{KafkaConfig, NotificationConfig};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::mailer::Mailer;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub work_queue: String,
    pub dead_letter_queue: String,
    /// Failed deliveries allowed before a message is dead-lettered.
    pub max_attempts: u32,
    pub malformed_policy: MalformedPolicy,
}

impl PipelineConfig {
    pub fn from_config(kafka: &KafkaConfig, notifications: &NotificationConfig) -> Self {
        Self {
            work_queue: kafka.mail_queue.clone(),
            dead_letter_queue: kafka.dead_letter_queue.clone(),
            max_attempts: notifications.max_attempts.max(1),
            malformed_policy: notifications.malformed_policy,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            work_queue: "send_mail_queue".to_string(),
            dead_letter_queue: "dead_letter_queue".to_string(),
            max_attempts: 3,
            malformed_policy: MalformedPolicy::Requeue,
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Mail sent, message acknowledged.
    Delivered,
    /// A copy carrying `retry_count` was republished and the original acknowledged.
    Retried { retry_count: u32 },
    /// Original body and headers moved to the dead-letter queue, original acknowledged.
    DeadLettered,
    /// Negatively acknowledged with requeue; the broker delivers it again.
    Requeued,
}

/// Consumes outbound mail requests and settles every delivery exactly once.
pub struct MailPipeline {
    queue: Arc<dyn MailQueue>,
    mailer: Arc<dyn Mailer>,
    config: PipelineConfig,
}

impl MailPipeline {
    pub fn new(queue: Arc<dyn MailQueue>, mailer: Arc<dyn Mailer>, config: PipelineConfig) -> Self {
        Self { queue, mailer, config }
    }

    /// Pulls deliveries until the queue ends or `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Mail pipeline consuming {}", self.config.work_queue);
        loop {
            let received = tokio::select! {
                received = self.queue.receive() => received,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            match received {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.process(delivery).await {
                        error!("Failed to settle delivery: {}", e);
                    }
                }
                Ok(None) => {
                    info!("Mail queue {} ended", self.config.work_queue);
                    break;
                }
                Err(e) => {
                    error!("Failed to receive from {}: {}", self.config.work_queue, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!("Mail pipeline stopped");
    }

    /// Attempts one delivery and settles it.
    pub async fn process(&self, delivery: Delivery) -> Result<DeliveryOutcome, BrokerError> {
        let request: OutboundMailRequest = match serde_json::from_slice(&delivery.body) {
            Ok(r) => r,
            Err(e) => {
                warn!("Malformed mail request {}: {}", delivery.tag, e);
                return match self.config.malformed_policy {
                    MalformedPolicy::Requeue => self.requeue(&delivery).await,
                    MalformedPolicy::DeadLetter => self.dead_letter(&delivery).await,
                };
            }
        };

        let attempt = AssertUnwindSafe(self.mailer.send(&request)).catch_unwind().await;
        match attempt {
            Ok(Ok(())) => {
                self.queue.ack(&delivery).await?;
                info!("Delivered {} ({})", delivery.tag, request.category);
                Ok(DeliveryOutcome::Delivered)
            }
            Ok(Err(e)) => {
                let retry_count = delivery.headers.retry_count().saturating_add(1);
                warn!(
                    "Delivery of {} failed (attempt {} of {}): {}",
                    delivery.tag, retry_count, self.config.max_attempts, e
                );
                if retry_count >= self.config.max_attempts {
                    self.dead_letter(&delivery).await
                } else {
                    self.retry(&delivery, retry_count).await
                }
            }
            Err(panic) => {
                error!("Mail handler panicked on {}: {}", delivery.tag, panic_message(&*panic));
                self.requeue(&delivery).await
            }
        }
    }

    async fn retry(&self, delivery: &Delivery, retry_count: u32) -> Result<DeliveryOutcome, BrokerError> {
        let headers = delivery.headers.clone().with_retry_count(retry_count);
        if let Err(e) = self
            .queue
            .publish(&self.config.work_queue, &delivery.body, &headers)
            .await
        {
            error!("Failed to republish {}: {}", delivery.tag, e);
            return self.requeue(delivery).await;
        }
        self.queue.ack(delivery).await?;
        debug!("Republished {} with retry count {}", delivery.tag, retry_count);
        Ok(DeliveryOutcome::Retried { retry_count })
    }

    async fn dead_letter(&self, delivery: &Delivery) -> Result<DeliveryOutcome, BrokerError> {
        if let Err(e) = self
            .queue
            .publish(&self.config.dead_letter_queue, &delivery.body, &delivery.headers)
            .await
        {
            error!("Failed to dead-letter {}: {}", delivery.tag, e);
            return self.requeue(delivery).await;
        }
        self.queue.ack(delivery).await?;
        warn!("Moved {} to {}", delivery.tag, self.config.dead_letter_queue);
        Ok(DeliveryOutcome::DeadLettered)
    }

    async fn requeue(&self, delivery: &Delivery) -> Result<DeliveryOutcome, BrokerError> {
        self.queue.nack(delivery, true).await?;
        debug!("Requeued {}", delivery.tag);
        Ok(DeliveryOutcome::Requeued)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::MailError;
    use async_trait::async_trait;
    use marquee_core::{MessageHeaders, RETRY_COUNT_HEADER};
    use marquee_store::MemoryMailQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WORK: &str = "send_mail_queue";
    const DLQ: &str = "dead_letter_queue";

    #[derive(Clone, Copy)]
    enum Behaviour {
        Succeed,
        Fail,
        Panic,
    }

    struct ScriptedMailer {
        behaviour: Behaviour,
        calls: AtomicUsize,
    }

    impl ScriptedMailer {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Mailer for ScriptedMailer {
        async fn send(&self, _request: &OutboundMailRequest) -> Result<(), MailError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => Err(MailError::RequestFailed("connection reset".to_string())),
                Behaviour::Panic => panic!("template renderer blew up"),
            }
        }
    }

    fn body() -> Vec<u8> {
        serde_json::to_vec(&OutboundMailRequest::text(
            "ada@example.com",
            "Your tickets",
            "See you at the movies",
            "Booking Confirmation",
        ))
        .unwrap()
    }

    fn pipeline(queue: &Arc<MemoryMailQueue>, mailer: Arc<ScriptedMailer>, policy: MalformedPolicy) -> MailPipeline {
        MailPipeline::new(
            queue.clone(),
            mailer,
            PipelineConfig {
                malformed_policy: policy,
                ..PipelineConfig::default()
            },
        )
    }

    async fn next(queue: &MemoryMailQueue) -> Delivery {
        queue.receive().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_success_acks_once() {
        let queue = Arc::new(MemoryMailQueue::new(WORK));
        let tag = queue.push(&body(), MessageHeaders::new());
        let p = pipeline(&queue, ScriptedMailer::new(Behaviour::Succeed), MalformedPolicy::Requeue);

        let outcome = p.process(next(&queue).await).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert_eq!(queue.acked(), vec![tag]);
        assert!(queue.nacked().is_empty());
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_three_failures_dead_letter_original() {
        let queue = Arc::new(MemoryMailQueue::new(WORK));
        let mut headers = MessageHeaders::new();
        headers.insert("x-correlation-id", "booking-77");
        queue.push(&body(), headers.clone());
        let mailer = ScriptedMailer::new(Behaviour::Fail);
        let p = pipeline(&queue, mailer.clone(), MalformedPolicy::Requeue);

        let first = p.process(next(&queue).await).await.unwrap();
        assert_eq!(first, DeliveryOutcome::Retried { retry_count: 1 });
        let copy = next(&queue).await;
        assert_eq!(copy.headers.get(RETRY_COUNT_HEADER), Some(&b"1"[..]));
        assert_eq!(copy.headers.get("x-correlation-id"), Some(&b"booking-77"[..]));

        let second = p.process(copy).await.unwrap();
        assert_eq!(second, DeliveryOutcome::Retried { retry_count: 2 });

        let third = p.process(next(&queue).await).await.unwrap();
        assert_eq!(third, DeliveryOutcome::DeadLettered);

        // Never handed to the work queue a fourth time
        assert!(queue.receive().await.unwrap().is_none());
        assert_eq!(mailer.calls.load(Ordering::SeqCst), 3);

        let dead = queue.messages(DLQ);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, body());
        assert_eq!(dead[0].headers.retry_count(), 2);
        assert_eq!(dead[0].headers.get("x-correlation-id"), Some(&b"booking-77"[..]));

        // Each of the three deliveries was acked exactly once
        let acked = queue.acked();
        assert_eq!(acked.len(), 3);
        let mut unique = acked.clone();
        unique.dedup();
        assert_eq!(unique.len(), 3);
        assert!(queue.nacked().is_empty());
    }

    #[tokio::test]
    async fn test_dead_letter_publish_failure_requeues() {
        let queue = Arc::new(MemoryMailQueue::new(WORK));
        queue.push(&body(), MessageHeaders::new().with_retry_count(2));
        queue.fail_publishes_to(DLQ);
        let p = pipeline(&queue, ScriptedMailer::new(Behaviour::Fail), MalformedPolicy::Requeue);

        let delivery = next(&queue).await;
        let tag = delivery.tag.clone();
        assert_eq!(p.process(delivery).await.unwrap(), DeliveryOutcome::Requeued);
        assert!(queue.acked().is_empty());
        assert_eq!(queue.nacked(), vec![(tag.clone(), true)]);

        // Once the dead-letter queue is back the same message goes through
        queue.allow_publishes_to(DLQ);
        let again = next(&queue).await;
        assert_eq!(again.tag, tag);
        assert_eq!(p.process(again).await.unwrap(), DeliveryOutcome::DeadLettered);
        assert_eq!(queue.messages(DLQ).len(), 1);
    }

    #[tokio::test]
    async fn test_retry_publish_failure_requeues() {
        let queue = Arc::new(MemoryMailQueue::new(WORK));
        queue.push(&body(), MessageHeaders::new());
        queue.fail_publishes_to(WORK);
        let p = pipeline(&queue, ScriptedMailer::new(Behaviour::Fail), MalformedPolicy::Requeue);

        assert_eq!(p.process(next(&queue).await).await.unwrap(), DeliveryOutcome::Requeued);
        assert!(queue.acked().is_empty());
        assert_eq!(queue.messages(WORK).len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_recovered() {
        let queue = Arc::new(MemoryMailQueue::new(WORK));
        let tag = queue.push(&body(), MessageHeaders::new());
        let p = pipeline(&queue, ScriptedMailer::new(Behaviour::Panic), MalformedPolicy::Requeue);

        assert_eq!(p.process(next(&queue).await).await.unwrap(), DeliveryOutcome::Requeued);
        assert_eq!(queue.nacked(), vec![(tag, true)]);
        assert!(queue.acked().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_policies() {
        let queue = Arc::new(MemoryMailQueue::new(WORK));
        queue.push(b"not json", MessageHeaders::new());
        let mailer = ScriptedMailer::new(Behaviour::Succeed);

        let requeueing = pipeline(&queue, mailer.clone(), MalformedPolicy::Requeue);
        assert_eq!(requeueing.process(next(&queue).await).await.unwrap(), DeliveryOutcome::Requeued);
        assert!(queue.messages(DLQ).is_empty());

        let dead_lettering = pipeline(&queue, mailer.clone(), MalformedPolicy::DeadLetter);
        assert_eq!(
            dead_lettering.process(next(&queue).await).await.unwrap(),
            DeliveryOutcome::DeadLettered
        );
        assert_eq!(queue.messages(DLQ)[0].body, b"not json".to_vec());
        assert_eq!(mailer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_accepts_capitalised_keys() {
        let queue = Arc::new(MemoryMailQueue::new(WORK));
        let legacy = br#"{"To":"ada@example.com","Subject":"Hi","Text":"Hello","Category":"Welcome"}"#;
        queue.push(legacy, MessageHeaders::new());
        let p = pipeline(&queue, ScriptedMailer::new(Behaviour::Succeed), MalformedPolicy::Requeue);

        assert_eq!(p.process(next(&queue).await).await.unwrap(), DeliveryOutcome::Delivered);
    }

    #[tokio::test]
    async fn test_run_drains_queue() {
        let queue = Arc::new(MemoryMailQueue::new(WORK));
        for _ in 0..3 {
            queue.push(&body(), MessageHeaders::new());
        }
        let mailer = ScriptedMailer::new(Behaviour::Succeed);
        let p = pipeline(&queue, mailer.clone(), MalformedPolicy::Requeue);
        let (_tx, rx) = watch::channel(false);

        p.run(rx).await;
        assert_eq!(queue.acked().len(), 3);
        assert_eq!(mailer.calls.load(Ordering::SeqCst), 3);
    }
}
