use async_trait::async_trait;
use marquee_core::{BrokerError, Delivery, DeliveryTag, MailQueue, MessageHeaders};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::app_config::KafkaConfig;

/// Mail queue backed by Kafka topics.
///
/// Offsets are committed by hand: `ack` commits past the message, `nack` with requeue seeks the
/// partition back so the same offset is fetched again.
pub struct KafkaMailQueue {
    consumer: StreamConsumer,
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaMailQueue {
    pub fn new(config: &KafkaConfig) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;
        consumer.subscribe(&[config.mail_queue.as_str()])?;

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        info!("Subscribed to {} as {}", config.mail_queue, config.group_id);
        Ok(Self {
            consumer,
            producer,
            timeout: Duration::from_secs(5),
        })
    }

    fn commit_past(&self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&tag.queue, tag.partition, Offset::Offset(tag.offset + 1))
            .map_err(unavailable)?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(unavailable)
    }
}

fn unavailable(err: KafkaError) -> BrokerError {
    BrokerError::Unavailable(err.to_string())
}

/// Copies a borrowed message out of the consumer's buffer.
fn detach(message: &BorrowedMessage<'_>) -> Delivery {
    let mut headers = MessageHeaders::new();
    if let Some(borrowed) = message.headers() {
        for header in borrowed.iter() {
            headers.insert(header.key, header.value.unwrap_or_default());
        }
    }

    Delivery {
        tag: DeliveryTag {
            queue: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
        },
        body: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
    }
}

#[async_trait]
impl MailQueue for KafkaMailQueue {
    async fn receive(&self) -> Result<Option<Delivery>, BrokerError> {
        let message = self.consumer.recv().await.map_err(unavailable)?;
        let delivery = detach(&message);
        debug!("Received {}", delivery.tag);
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.commit_past(&delivery.tag)
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        if !requeue {
            return self.commit_past(&delivery.tag);
        }
        let tag = &delivery.tag;
        self.consumer
            .seek(&tag.queue, tag.partition, Offset::Offset(tag.offset), self.timeout)
            .map_err(unavailable)
    }

    async fn publish(&self, queue: &str, body: &[u8], headers: &MessageHeaders) -> Result<(), BrokerError> {
        let mut owned = OwnedHeaders::new_with_capacity(headers.len());
        for (key, value) in headers.iter() {
            owned = owned.insert(Header { key, value: Some(value) });
        }

        let record = FutureRecord::<(), [u8]>::to(queue)
            .payload(body)
            .headers(owned);

        match self.producer.send(record, Timeout::After(self.timeout)).await {
            Ok(_) => {
                debug!("Published {} bytes to {}", body.len(), queue);
                Ok(())
            }
            Err((e, _msg)) => {
                error!("Failed to publish to {}: {}", queue, e);
                Err(BrokerError::PublishFailed {
                    queue: queue.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}
