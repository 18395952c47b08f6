use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

use crate::error::DecodeError;
use crate::ports::DlqRepository;
use crate::service::processor::{parse_topic, ServiceProcessor};

#[derive(Debug)]
pub struct RawIngestMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: OffsetDateTime,
}

/// Lane for a topic. Messages of one device always land on the same lane;
/// unroutable topics are spread by the topic itself.
pub fn lane_for(topic: &str, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    match parse_topic(topic) {
        Some(route) => route.device_id.hash(&mut hasher),
        None => topic.hash(&mut hasher),
    }
    (hasher.finish() % lanes.max(1) as u64) as usize
}

/// Device-partitioned workers.
///
/// Each lane is one task draining its own queue in order, which keeps
/// per-device ordering while different devices run in parallel.
pub struct WorkerPool {
    processor: Arc<ServiceProcessor>,
    dlq: Arc<dyn DlqRepository>,
    lanes: usize,
    lane_capacity: usize,
}

impl WorkerPool {
    pub fn new(processor: Arc<ServiceProcessor>, dlq: Arc<dyn DlqRepository>, lanes: usize, lane_capacity: usize) -> Self {
        Self { processor, dlq, lanes: lanes.max(1), lane_capacity: lane_capacity.max(1) }
    }

    /// Runs until `receiver` closes, then drains every lane.
    pub async fn run(self, mut receiver: Receiver<RawIngestMessage>) {
        info!("WorkerPool starting with {} lanes", self.lanes);
        let active_count = Arc::new(AtomicUsize::new(0));

        let mut senders: Vec<Sender<RawIngestMessage>> = Vec::with_capacity(self.lanes);
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.lanes);
        for lane in 0..self.lanes {
            let (tx, rx) = mpsc::channel(self.lane_capacity);
            senders.push(tx);
            handles.push(tokio::spawn(run_lane(
                lane,
                rx,
                self.processor.clone(),
                self.dlq.clone(),
                active_count.clone(),
            )));
        }

        while let Some(msg) = receiver.recv().await {
            let lane = lane_for(&msg.topic, self.lanes);
            metrics::gauge!("worker_lane_depth", (self.lane_capacity - senders[lane].capacity()) as f64, "lane" => lane.to_string());
            if let Err(e) = senders[lane].send(msg).await {
                error!(lane, "Lane closed: {}", e);
                metrics::counter!("worker_errors_total", 1, "type" => "channel_closed");
            }
        }

        drop(senders);
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Lane task panicked: {:?}", e);
            }
        }
        info!("WorkerPool shutting down");
    }
}

async fn run_lane(
    lane: usize,
    mut rx: Receiver<RawIngestMessage>,
    processor: Arc<ServiceProcessor>,
    dlq: Arc<dyn DlqRepository>,
    active_count: Arc<AtomicUsize>,
) {
    while let Some(msg) = rx.recv().await {
        let span = tracing::info_span!("worker_process", lane, topic = %msg.topic);

        async {
            let current = active_count.fetch_add(1, Ordering::SeqCst) + 1;
            metrics::gauge!("worker_active_count", current as f64);
            metrics::counter!("worker_jobs_started_total", 1);
            let start = std::time::Instant::now();

            if let Err(e) = processor.process_ingest_logic(&msg.topic, &msg.payload, msg.received_at).await {
                let reason = e.downcast_ref::<DecodeError>().map(DecodeError::reason).unwrap_or("processing_error");
                warn!(reason, "Message rejected: {}. Sending to DLQ.", e);
                metrics::counter!("telemetry_rejected_total", 1, "reason" => reason);

                if let Err(dlq_err) = dlq.send_to_dlq(msg.topic.clone(), msg.payload.clone(), e.to_string()).await {
                    error!("CRITICAL: Failed to send to DLQ: {:?}", dlq_err);
                    metrics::counter!("dlq_produce_errors_total", 1);
                } else {
                    metrics::counter!("dlq_messages_produced_total", 1);
                }
            }

            metrics::histogram!("worker_processing_duration_seconds", start.elapsed().as_secs_f64());
            let remaining = active_count.fetch_sub(1, Ordering::SeqCst) - 1;
            metrics::gauge!("worker_active_count", remaining as f64);
        }
        .instrument(span)
        .await;
    }
}
