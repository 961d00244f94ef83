use crate::prelude::*;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// A setting the dongle acknowledged with `success: true`.
#[derive(Clone, Debug, PartialEq)]
pub struct Confirmed {
    pub setting: Setting,
    pub metadata: serde_json::Value,
}

#[derive(Debug)]
enum Reply {
    Ack(Acknowledgment),
    LinkDown,
}

struct PendingCommand {
    key: String,
    issued_at: Instant,
    tx: oneshot::Sender<Reply>,
}

type PendingSlot = Arc<Mutex<Option<PendingCommand>>>;

// clears the pending slot however send_one exits, including cancellation
struct PendingGuard<'a>(&'a PendingSlot);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.0).take();
    }
}

fn lock(slot: &PendingSlot) -> MutexGuard<'_, Option<PendingCommand>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sends settings to the dongle one at a time.
///
/// Only one setting is ever waiting for a response. Callers of `send_one`
/// queue behind each other in arrival order on `flight`; the waiting key
/// lives in `pending` so `ingest_response` can find it.
#[derive(Clone)]
pub struct CommandChannel {
    config: ConfigWrapper,
    channels: Channels,
    link: LinkStatus,
    flight: Arc<tokio::sync::Mutex<()>>,
    pending: PendingSlot,
}

impl CommandChannel {
    pub fn new(config: ConfigWrapper, channels: Channels, link: LinkStatus) -> Self {
        Self {
            config,
            channels,
            link,
            flight: Arc::new(tokio::sync::Mutex::new(())),
            pending: Arc::new(Mutex::new(None)),
        }
    }

    pub fn response_timeout(&self) -> Duration {
        self.config.charging().response_timeout()
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.pending).is_some()
    }

    pub async fn send_one(&self, setting: &Setting, timeout: Duration) -> Result<Confirmed, CommandError> {
        let _flight = self.flight.lock().await;

        if !self.link.is_up() {
            warn!("not sending {}: mqtt not connected", setting);
            return Err(CommandError::TransportUnavailable);
        }

        let c = self.config.mqtt();
        let payload = setting.to_update_payload(c.source()).map_err(|err| {
            error!("failed to encode {}: {}", setting, err);
            CommandError::TransportUnavailable
        })?;

        // registered before publishing so a fast response can't slip past
        let (tx, rx) = oneshot::channel();
        let issued_at = Instant::now();
        *lock(&self.pending) = Some(PendingCommand {
            key: setting.key().to_string(),
            issued_at,
            tx,
        });
        let _guard = PendingGuard(&self.pending);

        let message = mqtt::Message {
            topic: c.update_topic(),
            retain: false,
            payload,
        };
        debug!("sending {}", setting);
        if self
            .channels
            .to_mqtt
            .send(mqtt::ChannelData::Message(message))
            .is_err()
        {
            warn!("not sending {}: nothing listening on to_mqtt", setting);
            return Err(CommandError::TransportUnavailable);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Reply::Ack(ack))) if ack.success => {
                let elapsed = issued_at.elapsed();
                debug!("{} confirmed after {:?}", setting, elapsed);
                Ok(Confirmed {
                    setting: setting.clone(),
                    metadata: ack.metadata,
                })
            }
            Ok(Ok(Reply::Ack(ack))) => {
                warn!("{} rejected by dongle: {}", setting, ack.metadata);
                Err(CommandError::AcknowledgmentRejected { key: ack.key })
            }
            Ok(Ok(Reply::LinkDown)) | Ok(Err(_)) => {
                warn!("{} abandoned: mqtt link lost", setting);
                Err(CommandError::TransportUnavailable)
            }
            Err(_) => {
                warn!("no response for {} after {:?}", setting, timeout);
                Err(CommandError::AcknowledgmentTimeout {
                    key: setting.key().to_string(),
                    timeout,
                })
            }
        }
    }

    /// Sends every setting in order, carrying on past failures.
    ///
    /// Succeeds only if each step was confirmed; otherwise lists the keys
    /// that were not.
    pub async fn send_sequence(&self, settings: &[Setting], timeout: Duration) -> Result<(), CommandError> {
        let total = settings.len();
        let mut failed = Vec::new();

        for (i, setting) in settings.iter().enumerate() {
            match self.send_one(setting, timeout).await {
                Ok(_) => info!("[{}/{}] {} confirmed", i + 1, total, setting),
                Err(err) => {
                    warn!("[{}/{}] {} failed: {}", i + 1, total, setting, err.reason());
                    failed.push(setting.key().to_string());
                    tokio::time::sleep(self.config.charging().fallback_delay()).await;
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(CommandError::SequenceIncomplete { failed })
        }
    }

    /// Handles a raw message from the dongle's response topic.
    pub fn ingest_response(&self, payload: &[u8]) {
        match Acknowledgment::from_payload(payload) {
            Ok(ack) => self.ingest_ack(ack),
            Err(err) => warn!("ignoring malformed response: {}", err),
        }
    }

    pub fn ingest_ack(&self, ack: Acknowledgment) {
        let mut slot = lock(&self.pending);

        match slot.take() {
            Some(pending) if pending.key == ack.key => {
                trace!(
                    "response for {} after {:?}",
                    pending.key,
                    pending.issued_at.elapsed()
                );
                // receiver gone means send_one already gave up
                let _ = pending.tx.send(Reply::Ack(ack));
            }
            Some(pending) => {
                debug!(
                    "discarding response for {} while waiting for {}",
                    ack.key, pending.key
                );
                *slot = Some(pending);
            }
            None => debug!("discarding unsolicited response for {}", ack.key),
        }
    }

    /// Fails whatever is waiting for a response.
    pub fn link_lost(&self) {
        if let Some(pending) = lock(&self.pending).take() {
            warn!("link lost while waiting for {}", pending.key);
            let _ = pending.tx.send(Reply::LinkDown);
        }
    }
}
