use crate::prelude::*;
use crate::coordinator::commands::{start_charge::StartCharge, stop_charge::StopCharge};

use chrono::{DateTime, Local, NaiveTime};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargeState {
    Idle,
    Starting,
    Charging,
    Stopping,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TargetReached,
    SafetyCutoff,
    Cancelled,
}

/// Published on `channels.charge_events`. Nobody listening is fine.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChargeEvent {
    Started {
        target_soc: u8,
        soc: Option<u8>,
    },
    Skipped {
        target_soc: u8,
        soc: u8,
    },
    StartFailed {
        target_soc: u8,
        reason: String,
    },
    Completed {
        target_soc: u8,
        final_soc: Option<u8>,
        reason: StopReason,
    },
    Stopped {
        target_soc: u8,
        soc: Option<u8>,
        reason: StopReason,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StartRequest {
    pub target_soc: u8,
    /// local time the dongle's charge window opens
    pub window_start: NaiveTime,
    /// schedule revision to complete against once the session is over
    pub revision: Option<u64>,
}

impl StartRequest {
    pub fn for_schedule(schedule: &Schedule, revision: u64) -> Self {
        Self {
            target_soc: schedule.target_soc,
            window_start: schedule.start_time.window_start(),
            revision: Some(revision),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Charging,
    AlreadyAtTarget { soc: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("target SOC must be between 10 and 100, got {0}")]
    InvalidTarget(u8),

    #[error("{0}")]
    Sequence(#[from] CommandError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub state: ChargeState,
    pub target_soc: Option<u8>,
    pub started_at: Option<DateTime<Local>>,
}

struct ActiveSession {
    id: u64,
    target_soc: u8,
    revision: Option<u64>,
    started_at: DateTime<Local>,
    token: CancellationToken,
}

struct Inner {
    state: ChargeState,
    active: Option<ActiveSession>,
    next_id: u64,
}

/// Drives one charge session at a time: enable, watch SOC, disable.
///
/// Transitions are serialized on `transition`; `inner` only ever guards
/// quick reads and writes so status queries never wait on the dongle.
#[derive(Clone)]
pub struct ChargeSession {
    config: ConfigWrapper,
    channels: Channels,
    command_channel: CommandChannel,
    tracker: SocTracker,
    scheduler: Scheduler,
    transition: Arc<tokio::sync::Mutex<()>>,
    inner: Arc<Mutex<Inner>>,
}

impl ChargeSession {
    pub fn new(
        config: ConfigWrapper,
        channels: Channels,
        command_channel: CommandChannel,
        tracker: SocTracker,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            config,
            channels,
            command_channel,
            tracker,
            scheduler,
            transition: Arc::new(tokio::sync::Mutex::new(())),
            inner: Arc::new(Mutex::new(Inner {
                state: ChargeState::Idle,
                active: None,
                next_id: 1,
            })),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ChargeState {
        self.inner().state
    }

    pub fn is_charging(&self) -> bool {
        self.state() == ChargeState::Charging
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner();
        SessionSnapshot {
            state: inner.state,
            target_soc: inner.active.as_ref().map(|a| a.target_soc),
            started_at: inner.active.as_ref().map(|a| a.started_at),
        }
    }

    pub async fn start(&self, request: StartRequest) -> Result<StartOutcome, SessionError> {
        let target_soc = request.target_soc;
        if schedule::validate_target_soc(target_soc).is_err() {
            return Err(SessionError::InvalidTarget(target_soc));
        }

        let _transition = self.transition.lock().await;

        // the old monitor must be gone before we talk to the dongle
        let superseded = self.inner().active.take();
        if let Some(previous) = &superseded {
            info!("superseding charge session {}", previous.id);
            previous.token.cancel();
        }
        let superseded = superseded.is_some();

        match self.tracker.soc() {
            Some(soc) if soc >= target_soc => {
                info!("SOC {}% already at or above target {}%, not charging", soc, target_soc);
                if superseded {
                    self.disable_superseded().await;
                }
                self.set_state(ChargeState::Idle);
                self.complete_schedule(request.revision);
                self.emit(ChargeEvent::Skipped { target_soc, soc });
                return Ok(StartOutcome::AlreadyAtTarget { soc });
            }
            Some(soc) => info!("starting charge session: {}% -> {}%", soc, target_soc),
            None => warn!("SOC unknown, starting charge session to {}% anyway", target_soc),
        }

        self.set_state(ChargeState::Starting);

        let charging = self.config.charging();
        let sequence = StartCharge::new(
            self.command_channel.clone(),
            request.window_start,
            charging.safety_cutoff_hours(),
            target_soc,
        );

        if let Err(err) = sequence.run(charging.response_timeout()).await {
            error!("failed to start charging: {}", err);
            if superseded {
                self.disable_superseded().await;
            }
            self.set_state(ChargeState::Idle);
            self.complete_schedule(request.revision);
            self.emit(ChargeEvent::StartFailed {
                target_soc,
                reason: err.to_string(),
            });
            return Err(SessionError::Sequence(err));
        }

        let token = CancellationToken::new();
        let id = {
            let mut inner = self.inner();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.active = Some(ActiveSession {
                id,
                target_soc,
                revision: request.revision,
                started_at: Local::now(),
                token: token.clone(),
            });
            inner.state = ChargeState::Charging;
            id
        };

        info!("charging to {}% (session {})", target_soc, id);
        self.emit(ChargeEvent::Started {
            target_soc,
            soc: self.tracker.soc(),
        });

        let session = self.clone();
        tokio::spawn(async move { session.monitor(id, target_soc, token).await });

        Ok(StartOutcome::Charging)
    }

    /// Stops the active session. `Ok(false)` if there was nothing to stop.
    ///
    /// The session is over even when the dongle does not confirm the
    /// disable; the error is still returned so callers can report it.
    pub async fn cancel(&self) -> Result<bool, SessionError> {
        let _transition = self.transition.lock().await;

        let target_soc = match self.inner().active.as_ref() {
            Some(active) => active.target_soc,
            None => return Ok(false),
        };

        info!("cancelling charge session");
        let result = self.stop_charging().await;

        self.emit(ChargeEvent::Stopped {
            target_soc,
            soc: self.tracker.soc(),
            reason: StopReason::Cancelled,
        });

        result.map(|_| true).map_err(SessionError::Sequence)
    }

    async fn monitor(&self, id: u64, target_soc: u8, token: CancellationToken) {
        let charging = self.config.charging();

        let cutoff = tokio::time::sleep(charging.safety_cutoff());
        tokio::pin!(cutoff);

        let mut ticker = tokio::time::interval(charging.soc_check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut updates = self.tracker.subscribe();

        debug!("session {} monitor running", id);

        let reason = loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("session {} monitor cancelled", id);
                    return;
                }
                _ = &mut cutoff => break StopReason::SafetyCutoff,
                _ = ticker.tick() => {}
                _ = updates.changed() => {}
            }

            match self.tracker.soc() {
                Some(soc) if soc >= target_soc => {
                    info!("target reached: SOC {}% >= {}%", soc, target_soc);
                    break StopReason::TargetReached;
                }
                Some(soc) => trace!("SOC {}% < {}%, still charging", soc, target_soc),
                // no data is never a reason to stop
                None => trace!("SOC unknown, still charging"),
            }
        };

        if reason == StopReason::SafetyCutoff {
            warn!(
                "safety cutoff after {}h, stopping session {}",
                charging.safety_cutoff_hours(),
                id
            );
        }

        self.finish(id, reason).await;
    }

    async fn finish(&self, id: u64, reason: StopReason) {
        let _transition = self.transition.lock().await;

        let (target_soc, revision) = match self.inner().active.as_ref() {
            Some(active) if active.id == id => (active.target_soc, active.revision),
            // cancelled or superseded while we waited
            _ => return,
        };

        if let Err(err) = self.stop_charging().await {
            error!("failed to disable AC charging: {}", err);
        }

        let final_soc = self.tracker.soc();
        info!(
            "charge session {} complete: {:?}, final SOC {:?}",
            id, reason, final_soc
        );
        self.complete_schedule(revision);
        self.emit(ChargeEvent::Completed {
            target_soc,
            final_soc,
            reason,
        });
    }

    // disable command first, then tear down the monitor, then go idle
    async fn stop_charging(&self) -> Result<(), CommandError> {
        self.set_state(ChargeState::Stopping);

        let result = StopCharge::new(self.command_channel.clone())
            .run(self.config.charging().response_timeout())
            .await;

        let mut inner = self.inner();
        if let Some(active) = inner.active.take() {
            active.token.cancel();
        }
        inner.state = ChargeState::Idle;

        result
    }

    // the replaced session left AC charging on and nothing else will turn it off
    async fn disable_superseded(&self) {
        self.set_state(ChargeState::Stopping);

        if let Err(err) = StopCharge::new(self.command_channel.clone())
            .run(self.config.charging().response_timeout())
            .await
        {
            error!("failed to disable AC charging left on by superseded session: {}", err);
        }
    }

    fn set_state(&self, state: ChargeState) {
        self.inner().state = state;
    }

    fn complete_schedule(&self, revision: Option<u64>) {
        if let Some(revision) = revision {
            self.scheduler.complete(revision);
        }
    }

    fn emit(&self, event: ChargeEvent) {
        debug!("charge event: {:?}", event);
        let _ = self.channels.charge_events.send(event);
    }
}
