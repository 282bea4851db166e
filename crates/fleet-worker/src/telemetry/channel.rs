//! Bounded, non-blocking telemetry path from workers to the aggregator.

use std::sync::Arc;

use fleet_protocol::TelemetrySample;
use tokio::sync::mpsc;
use tracing::debug;

use super::aggregator::TelemetryAggregator;

/// Default capacity of the telemetry channel (samples in flight).
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Create the telemetry channel.
///
/// The bus hands out emitters; the loop must be spawned on the runtime and
/// ends once the bus and every emitter have been dropped.
pub fn telemetry_channel(
    aggregator: Arc<TelemetryAggregator>,
    capacity: usize,
) -> (TelemetryBus, IngestLoop) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let bus = TelemetryBus {
        tx,
        aggregator: Arc::clone(&aggregator),
    };
    (bus, IngestLoop { rx, aggregator })
}

/// Factory of per-worker emitters.
#[derive(Debug, Clone)]
pub struct TelemetryBus {
    tx: mpsc::Sender<TelemetrySample>,
    aggregator: Arc<TelemetryAggregator>,
}

impl TelemetryBus {
    /// Emitter bound to one instance (`generation`) of a worker slot.
    pub fn emitter(&self, worker: usize, generation: u32) -> TelemetryEmitter {
        TelemetryEmitter {
            worker,
            generation,
            tx: self.tx.clone(),
            aggregator: Arc::clone(&self.aggregator),
        }
    }

    pub fn aggregator(&self) -> &Arc<TelemetryAggregator> {
        &self.aggregator
    }
}

/// Per-worker handle used by a pipeline to report processed frames.
#[derive(Debug, Clone)]
pub struct TelemetryEmitter {
    worker: usize,
    generation: u32,
    tx: mpsc::Sender<TelemetrySample>,
    aggregator: Arc<TelemetryAggregator>,
}

impl TelemetryEmitter {
    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Queue one sample without waiting.
    ///
    /// Returns `false` when the sample was dropped (channel full or closed);
    /// drops are counted on the aggregator.
    pub fn emit(&self, timestamp: f64, detections: u32) -> bool {
        let sample =
            TelemetrySample::new(self.worker, timestamp, detections).with_generation(self.generation);
        match self.tx.try_send(sample) {
            Ok(()) => true,
            Err(_) => {
                self.aggregator.note_dropped();
                false
            }
        }
    }
}

/// Drains the channel into the aggregator.
#[derive(Debug)]
pub struct IngestLoop {
    rx: mpsc::Receiver<TelemetrySample>,
    aggregator: Arc<TelemetryAggregator>,
}

impl IngestLoop {
    /// Run until every sender is gone. Returns the number of samples ingested.
    pub async fn run(mut self) -> u64 {
        let mut ingested = 0u64;
        while let Some(sample) = self.rx.recv().await {
            self.aggregator.ingest(sample);
            ingested += 1;
        }
        debug!("Telemetry channel closed after {} samples", ingested);
        ingested
    }
}
