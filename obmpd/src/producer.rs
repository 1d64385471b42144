//! Message-bus publisher: drains the bus channel into a Kafka producer.
//!
//! One task owns the producer for the whole process. Enqueueing never
//! blocks the ingest pipeline: when librdkafka's queue is full or the
//! brokers are unreachable, the record is dropped with a warning and the
//! client reconnects in the background. On shutdown the channel is drained
//! and the outbound queue flushed with a bounded wait.

use crate::config::AppConfig;
use futures::stream::{FuturesUnordered, StreamExt};
use metrics::counter;
use obmpd_lib::bus::{BusReceiver, BusRecord};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Bounded drain at shutdown: up to 8 polls of 500 ms each.
const FLUSH_POLLS: u32 = 8;
const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub async fn handle(cfg: Arc<AppConfig>, mut rx: BusReceiver) {
    let producer = match build_producer(&cfg) {
        Ok(producer) => producer,
        Err(e) => {
            // nothing to publish to; drain and drop so workers never stall
            error!(error = %e, "cannot create the kafka producer, records will be discarded");
            while rx.recv().await.is_some() {}
            return;
        }
    };
    info!(brokers = %cfg.kafka_brokers, "kafka producer created");

    let mut deliveries = FuturesUnordered::new();
    loop {
        tokio::select! {
            record = rx.recv() => match record {
                Some(record) => {
                    if let Some(delivery) = send(&producer, record) {
                        deliveries.push(delivery);
                    }
                }
                None => break,
            },
            Some(result) = deliveries.next(), if !deliveries.is_empty() => {
                observe_delivery(result);
            }
        }
    }

    // all senders are gone: collect outstanding deliveries, then flush
    debug!(outstanding = deliveries.len(), "bus channel closed, draining producer");
    while let Some(result) = deliveries.next().await {
        observe_delivery(result);
    }
    for _ in 0..FLUSH_POLLS {
        if producer.in_flight_count() == 0 {
            break;
        }
        if let Err(e) = producer.flush(FLUSH_POLL_INTERVAL) {
            debug!(error = %e, in_flight = producer.in_flight_count(), "flush still pending");
        }
    }
    let leftover = producer.in_flight_count();
    if leftover > 0 {
        warn!(leftover, "shutting down with undelivered records");
    }
    info!("kafka producer stopped");
}

fn build_producer(cfg: &AppConfig) -> Result<FutureProducer, rdkafka::error::KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &cfg.kafka_brokers)
        // idle-disconnect noise from brokers enforcing connections.max.idle.ms
        .set("log.connection.close", "false")
        .set("api.version.request", "true");
    // passthrough tuning wins over the defaults above
    for (key, value) in &cfg.librdkafka {
        client_config.set(key, value);
    }
    client_config.create()
}

type DeliveryFuture = rdkafka::producer::DeliveryFuture;

/// Hands one record to librdkafka without waiting on the queue. Returns
/// the delivery future, or None when the record was dropped.
fn send(producer: &FutureProducer, record: BusRecord) -> Option<DeliveryFuture> {
    let payload_len = record.payload.len();
    let future_record = FutureRecord::to(&record.topic)
        .payload(record.payload.as_ref())
        .key(&record.key[..])
        .timestamp(record.timestamp_ms);
    match producer.send_result(future_record) {
        Ok(delivery) => {
            trace!(topic = %record.topic, len = payload_len, "record enqueued");
            Some(delivery)
        }
        Err((e, _)) => {
            counter!("obmpd_kafka_messages_total", "status" => "dropped").increment(1);
            warn!(topic = %record.topic, error = %e, "producer queue rejected record, dropping");
            None
        }
    }
}

fn observe_delivery(
    result: Result<rdkafka::producer::future_producer::OwnedDeliveryResult, futures::channel::oneshot::Canceled>,
) {
    match result {
        Ok(Ok(delivery)) => {
            counter!("obmpd_kafka_messages_total", "status" => "success").increment(1);
            trace!(
                partition = delivery.0,
                offset = delivery.1,
                "record delivered"
            );
        }
        Ok(Err((e, _message))) => {
            counter!("obmpd_kafka_messages_total", "status" => "failure").increment(1);
            error!(error = %e, "record delivery failed");
        }
        Err(_cancelled) => {
            counter!("obmpd_kafka_messages_total", "status" => "failure").increment(1);
            debug!("delivery future cancelled");
        }
    }
}
