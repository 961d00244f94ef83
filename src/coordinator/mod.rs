use crate::prelude::*;

pub mod commands;
pub mod session;

use crate::command::CommandReply;
use crate::scheduler::ScheduleFired;
use session::{ChargeSession, ChargeState, SessionError, StartOutcome, StartRequest};

use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a status query reports.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChargeStatus {
    pub state: ChargeState,
    pub is_charging: bool,
    pub current_soc: Option<u8>,
    pub target_soc: Option<u8>,
    pub power: f64,
    pub charging_power: f64,
    pub next_run: Option<DateTime<Local>>,
    pub mode: Option<ScheduleMode>,
    pub enabled: Option<bool>,
    pub charge_started_at: Option<DateTime<Local>>,
    pub link_up: bool,
    pub last_updated: Option<DateTime<Local>>,
}

#[derive(Clone)]
pub struct Coordinator {
    config: ConfigWrapper,
    channels: Channels,
    link: LinkStatus,
    command_channel: CommandChannel,
    tracker: SocTracker,
    scheduler: Scheduler,
    session: ChargeSession,
    fired: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ScheduleFired>>>,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(config: ConfigWrapper, channels: Channels, link: LinkStatus) -> Self {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();

        let file = config.schedule_file().map(|path| ScheduleFile::new(path.clone()));
        let scheduler = Scheduler::new(file, fired_tx);
        let command_channel = CommandChannel::new(config.clone(), channels.clone(), link.clone());
        let tracker = SocTracker::new();
        let session = ChargeSession::new(
            config.clone(),
            channels.clone(),
            command_channel.clone(),
            tracker.clone(),
            scheduler.clone(),
        );

        Self {
            config,
            channels,
            link,
            command_channel,
            tracker,
            scheduler,
            session,
            fired: Arc::new(tokio::sync::Mutex::new(fired_rx)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn command_channel(&self) -> &CommandChannel {
        &self.command_channel
    }

    pub fn tracker(&self) -> &SocTracker {
        &self.tracker
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn session(&self) -> &ChargeSession {
        &self.session
    }

    pub async fn start(&self) -> Result<()> {
        futures::try_join!(
            self.mqtt_receiver(),
            self.schedule_receiver(),
            self.event_forwarder()
        )?;

        Ok(())
    }

    /// Disables charging if a session is running, then stops the loops.
    /// Must run before the MQTT client stops so the disable can be confirmed.
    pub async fn stop(&self) {
        info!("Stopping coordinator...");

        match self.session.cancel().await {
            Ok(true) => info!("charging disabled for shutdown"),
            Ok(false) => {}
            Err(err) => warn!("could not disable charging on shutdown: {}", err),
        }

        self.scheduler.stop();
        self.shutdown.cancel();
    }

    /// Re-arms the schedule saved by a previous run, if any.
    pub fn restore_schedule(&self) -> Option<Schedule> {
        let path = self.config.schedule_file()?;
        let schedule = ScheduleFile::new(path.clone()).load()?;

        info!(
            "restoring saved schedule: {}% at {} ({})",
            schedule.target_soc, schedule.start_time, schedule.mode
        );
        Some(self.scheduler.restore(schedule))
    }

    // Collaborator interface {{{
    pub async fn create_or_replace_schedule(&self, request: ScheduleRequest) -> Result<Schedule> {
        let schedule = Schedule::new(request, Local::now())?;

        // a running session belongs to the schedule being replaced
        if let Err(err) = self.session.cancel().await {
            warn!("stopping previous session: {}", err);
        }

        Ok(self.scheduler.set_schedule(schedule))
    }

    pub fn current_schedule(&self) -> Option<Schedule> {
        self.scheduler.current()
    }

    /// Stops any running session and removes the schedule. Idle is a no-op.
    pub async fn cancel_schedule(&self) -> Result<bool, SessionError> {
        let stopped = self.session.cancel().await;
        let removed = self.scheduler.cancel();

        Ok(stopped? || removed)
    }

    pub async fn enable_immediate(&self, target_soc: u8) -> Result<StartOutcome, SessionError> {
        let now = Local::now();
        let schedule =
            Schedule::immediate(target_soc, now).map_err(|_| SessionError::InvalidTarget(target_soc))?;

        info!("enabling AC charging now, target {}%", target_soc);
        let revision = self.scheduler.adopt(schedule.clone());

        self.session
            .start(StartRequest::for_schedule(&schedule, revision))
            .await
    }

    /// Stops charging and forgets the schedule. `Ok(false)` when idle.
    pub async fn disable_immediate(&self) -> Result<bool, SessionError> {
        info!("disabling AC charging now");

        let stopped = self.session.cancel().await;
        self.scheduler.cancel();

        stopped
    }

    pub fn status(&self) -> ChargeStatus {
        let session = self.session.snapshot();
        let battery = self.tracker.snapshot();
        let schedule = self.scheduler.current();

        ChargeStatus {
            state: session.state,
            is_charging: session.state == ChargeState::Charging,
            current_soc: battery.soc,
            target_soc: session
                .target_soc
                .or_else(|| schedule.as_ref().map(|s| s.target_soc)),
            power: battery.power,
            charging_power: battery.power.max(0.0),
            next_run: schedule.as_ref().and_then(|s| s.next_run),
            mode: schedule.as_ref().map(|s| s.mode),
            enabled: schedule.as_ref().map(|s| s.enabled),
            charge_started_at: session.started_at,
            link_up: self.link.is_up(),
            last_updated: battery.updated_at,
        }
    } // }}}

    async fn mqtt_receiver(&self) -> Result<()> {
        use mqtt::ChannelData::*;

        let mut receiver = self.channels.from_mqtt.subscribe();

        loop {
            let data = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                data = receiver.recv() => data,
            };

            match data {
                Ok(Message(message)) => self.process_message(message),
                Ok(LinkDown) => self.command_channel.link_lost(),
                Ok(Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("coordinator lagged, {} mqtt messages dropped", n)
                }
            }
        }

        debug!("coordinator mqtt receiver exiting");
        Ok(())
    }

    fn process_message(&self, message: mqtt::Message) {
        let c = self.config.mqtt();

        if message.topic == c.response_topic() {
            self.command_channel.ingest_response(message.payload.as_bytes());
        } else if message.topic == c.telemetry_topic() {
            self.tracker.ingest_payload(message.payload.as_bytes());
        } else if message.topic.starts_with(&format!("{}/cmd/", c.namespace())) {
            match message.to_command(c.namespace()) {
                Ok(command) => {
                    // commands can wait on the dongle; responses must keep flowing
                    let coordinator = self.clone();
                    tokio::spawn(async move { coordinator.process_command(command).await });
                }
                Err(err) => {
                    warn!("{}", err);
                    self.reply_to_bad_command(&message, &err.to_string());
                }
            }
        } else {
            trace!("ignoring message on {}", message.topic);
        }
    }

    async fn process_command(&self, command: Command) {
        use Command::*;

        debug!("processing command {:?}", command);

        let reply = match &command {
            SetSchedule(request) => match self.create_or_replace_schedule(request.clone()).await {
                Ok(schedule) => CommandReply::ok(
                    match schedule.next_run {
                        Some(next_run) => format!("schedule set, next run {}", next_run),
                        None => "schedule stored, disabled".to_string(),
                    },
                    serde_json::to_value(&schedule).ok(),
                ),
                Err(err) => CommandReply::fail(err.to_string()),
            },
            GetSchedule => match self.current_schedule() {
                Some(schedule) => CommandReply::ok("schedule", serde_json::to_value(&schedule).ok()),
                None => CommandReply::ok("no schedule", None),
            },
            CancelSchedule => match self.cancel_schedule().await {
                Ok(true) => CommandReply::ok("schedule cancelled", None),
                Ok(false) => CommandReply::ok("no schedule", None),
                Err(err) => CommandReply::fail(err.to_string()),
            },
            EnableCharging(target_soc) => match self.enable_immediate(*target_soc).await {
                Ok(StartOutcome::Charging) => {
                    CommandReply::ok(format!("charging enabled to {}%", target_soc), None)
                }
                Ok(StartOutcome::AlreadyAtTarget { soc }) => CommandReply::ok(
                    format!("SOC {}% already at or above {}%, not charging", soc, target_soc),
                    None,
                ),
                Err(err) => CommandReply::fail(err.to_string()),
            },
            DisableCharging => match self.disable_immediate().await {
                Ok(true) => CommandReply::ok("charging disabled", None),
                Ok(false) => CommandReply::ok("not charging", None),
                Err(err) => CommandReply::fail(err.to_string()),
            },
            Status => CommandReply::ok("status", serde_json::to_value(self.status()).ok()),
        };

        match reply.to_message(&command, self.config.mqtt().namespace()) {
            Ok(message) => self.publish(message),
            Err(err) => error!("failed to encode reply to {:?}: {}", command, err),
        }
    }

    fn reply_to_bad_command(&self, message: &mqtt::Message, reason: &str) {
        let namespace = self.config.mqtt().namespace();

        if let Ok(parts) = message.split_cmd_topic(namespace) {
            if let Ok(payload) = serde_json::to_string(&CommandReply::fail(reason)) {
                self.publish(mqtt::Message {
                    topic: format!("{}/result/{}", namespace, parts.join("/")),
                    retain: false,
                    payload,
                });
            }
        }
    }

    async fn schedule_receiver(&self) -> Result<()> {
        let mut fired = self.fired.lock().await;

        loop {
            let ScheduleFired { revision } = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = fired.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let schedule = match self.scheduler.begin_run(revision) {
                Some(schedule) => schedule,
                None => continue,
            };

            info!(
                "schedule fired: charging to {}% ({})",
                schedule.target_soc, schedule.mode
            );

            let session = self.session.clone();
            tokio::spawn(async move {
                let request = StartRequest::for_schedule(&schedule, revision);
                if let Err(err) = session.start(request).await {
                    error!("scheduled charge failed to start: {}", err);
                }
            });
        }

        debug!("coordinator schedule receiver exiting");
        Ok(())
    }

    async fn event_forwarder(&self) -> Result<()> {
        let mut events = self.channels.charge_events.subscribe();
        let topic = format!("{}/events", self.config.mqtt().namespace());

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(event) => self.publish(mqtt::Message {
                    topic: topic.clone(),
                    retain: false,
                    payload: serde_json::to_string(&event)?,
                }),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("event forwarder lagged, {} events dropped", n)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        debug!("coordinator event forwarder exiting");
        Ok(())
    }

    fn publish(&self, message: mqtt::Message) {
        if self
            .channels
            .to_mqtt
            .send(mqtt::ChannelData::Message(message))
            .is_err()
        {
            debug!("send(to_mqtt) failed - mqtt disabled?");
        }
    }
}
