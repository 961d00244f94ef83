use crate::prelude::*;

use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::Arc;

/// Last known battery state. Replaced as a whole on every sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct SocSnapshot {
    pub soc: Option<u8>,
    /// positive while charging, negative while discharging
    pub power: f64,
    pub updated_at: Option<DateTime<Local>>,
}

#[derive(Clone, Debug)]
pub struct SocTracker {
    tx: Arc<watch::Sender<SocSnapshot>>,
}

impl Default for SocTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SocTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SocSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn ingest(&self, sample: TelemetrySample) {
        let power = sample.battery_power();

        self.tx.send_modify(|snapshot| {
            // a sample without SOC keeps the last one we saw
            if let Some(soc) = sample.soc {
                snapshot.soc = Some(soc);
            }
            snapshot.power = power;
            snapshot.updated_at = Some(Local::now());
        });

        debug!("telemetry: soc={:?} power={}W", sample.soc, power);
    }

    /// Parses a raw telemetry message; malformed ones are logged and dropped.
    pub fn ingest_payload(&self, payload: &[u8]) {
        match TelemetrySample::from_payload(payload) {
            Ok(sample) => self.ingest(sample),
            Err(err) => warn!("ignoring malformed telemetry: {}", err),
        }
    }

    pub fn soc(&self) -> Option<u8> {
        self.tx.borrow().soc
    }

    pub fn snapshot(&self) -> SocSnapshot {
        *self.tx.borrow()
    }

    /// Wakes on every ingested sample, whether or not SOC changed.
    pub fn subscribe(&self) -> watch::Receiver<SocSnapshot> {
        self.tx.subscribe()
    }
}
