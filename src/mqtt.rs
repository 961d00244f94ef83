use crate::prelude::*;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Publish, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const PUBLISH_ATTEMPTS: u32 = 3;

// Message {{{
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub retain: bool,
    pub payload: String,
}

impl Message {
    pub fn to_command(&self, namespace: &str) -> Result<Command> {
        use Command::*;

        let parts = self.split_cmd_topic(namespace)?;

        let r = match parts[..] {
            ["schedule", "set"] => SetSchedule(serde_json::from_str(&self.payload)?),
            ["schedule", "get"] => GetSchedule,
            ["schedule", "cancel"] => CancelSchedule,
            ["charging", "enable"] => EnableCharging(self.payload_int()?),
            ["charging", "disable"] => DisableCharging,
            ["status"] => Status,
            [..] => bail!("unhandled: {:?}", self),
        };

        Ok(r)
    }

    // given a cmd Message, return the parts after the cmd prefix.
    //
    // eg solar/cmd/charging/enable => ['charging', 'enable']
    pub fn split_cmd_topic(&self, namespace: &str) -> Result<Vec<&str>> {
        let rest = self
            .topic
            .strip_prefix(namespace)
            .and_then(|t| t.strip_prefix("/cmd/"));

        match rest {
            Some(rest) if !rest.is_empty() => Ok(rest.split('/').collect()),
            // this *shouldn't* happen as our subscribe is for {namespace}/cmd/#
            _ => bail!("ignoring badly formed MQTT topic: {}", self.topic),
        }
    }

    fn payload_int(&self) -> Result<u8> {
        self.payload
            .trim()
            .parse()
            .map_err(|err| anyhow!("payload_int: {}", err))
    }
} // }}}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    Message(Message),
    LinkDown,
    Shutdown,
}

pub type Sender = broadcast::Sender<ChannelData>;

/// Whether the broker connection is currently up, shared with everything
/// that must fail fast instead of queueing into a dead link.
#[derive(Clone, Debug, Default)]
pub struct LinkStatus(Arc<AtomicBool>);

impl LinkStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_up(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, up: bool) {
        self.0.store(up, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct Mqtt {
    config: ConfigWrapper,
    channels: Channels,
    link: LinkStatus,
    shutdown: CancellationToken,
}

impl Mqtt {
    pub fn new(config: ConfigWrapper, channels: Channels, link: LinkStatus) -> Self {
        Self {
            config,
            channels,
            link,
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let c = self.config.mqtt();

        if !c.enabled() {
            info!("mqtt disabled, skipping");
            return Ok(());
        }

        let mut options = MqttOptions::new(c.client_id(), c.host(), c.port());

        let will = LastWill {
            topic: self.lwt_topic(),
            message: bytes::Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        options.set_last_will(will);

        options.set_keep_alive(Duration::from_secs(60));
        if let (Some(u), Some(p)) = (c.username(), c.password()) {
            options.set_credentials(u, p);
        }

        info!("initializing mqtt at {}:{}", c.host(), c.port());

        let (client, mut eventloop) = AsyncClient::new(options, 10);

        self.connect(&client, &mut eventloop).await?;

        futures::try_join!(self.receiver(client.clone(), eventloop), self.sender(client))?;

        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        info!("Stopping MQTT client...");
        let _ = self.channels.to_mqtt.send(ChannelData::Shutdown);
        self.shutdown.cancel();
        Ok(())
    }

    // initial connection, with backoff. rumqttc handles reconnects after this.
    async fn connect(&self, client: &AsyncClient, eventloop: &mut EventLoop) -> Result<()> {
        let attempts = self.config.mqtt().connect_retries().max(1);

        for attempt in 1..=attempts {
            info!("connecting to mqtt (attempt {}/{})", attempt, attempts);

            match tokio::time::timeout(CONNECT_TIMEOUT, Self::wait_for_connack(eventloop)).await {
                Ok(Ok(())) => {
                    self.on_connected(client)?;
                    return Ok(());
                }
                Ok(Err(e)) => warn!("mqtt connection failed on attempt {}/{}: {}", attempt, attempts, e),
                Err(_) => warn!("mqtt connection timeout on attempt {}/{}", attempt, attempts),
            }

            if attempt < attempts {
                let delay = Duration::from_secs(u64::from((attempt * 2).min(10)));
                info!("retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
            }
        }

        bail!("failed to connect to mqtt after {} attempts", attempts)
    }

    async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
        loop {
            if let Event::Incoming(Incoming::ConnAck(_)) = eventloop.poll().await? {
                return Ok(());
            }
        }
    }

    // (re)subscribe on every connack; the session is not persistent.
    fn on_connected(&self, client: &AsyncClient) -> Result<()> {
        let c = self.config.mqtt();

        self.link.set(true);
        info!("mqtt connected");

        client.try_publish(self.lwt_topic(), QoS::AtLeastOnce, true, "online")?;

        for topic in [
            c.telemetry_topic(),
            c.response_topic(),
            format!("{}/cmd/#", c.namespace()),
        ] {
            client.try_subscribe(&topic, QoS::AtMostOnce)?;
            info!("subscribed to {}", topic);
        }

        Ok(())
    }

    fn on_link_down(&self) {
        if self.link.is_up() {
            warn!("mqtt link down");
        }
        self.link.set(false);
        // fails any command currently waiting on a response
        let _ = self.channels.from_mqtt.send(ChannelData::LinkDown);
    }

    // mqtt -> coordinator
    async fn receiver(&self, client: AsyncClient, mut eventloop: EventLoop) -> Result<()> {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    if let Err(e) = self.handle_message(publish) {
                        warn!("{}", e);
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    if let Err(e) = self.on_connected(&client) {
                        error!("resubscribe failed: {}", e);
                    }
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => self.on_link_down(),
                Err(e) => {
                    error!("{}", e);
                    self.on_link_down();
                    info!("reconnecting in {:?}", RECONNECT_DELAY);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
                _ => {} // keepalives etc
            }
        }

        self.link.set(false);
        info!("MQTT receiver loop exiting");
        Ok(())
    }

    fn handle_message(&self, publish: Publish) -> Result<()> {
        let message = Message {
            topic: publish.topic,
            retain: publish.retain,
            payload: String::from_utf8(publish.payload.to_vec())?,
        };
        debug!("RX: {:?}", message);
        if self
            .channels
            .from_mqtt
            .send(ChannelData::Message(message))
            .is_err()
        {
            bail!("send(from_mqtt) failed - channel closed?");
        }

        Ok(())
    }

    // coordinator -> mqtt
    async fn sender(&self, client: AsyncClient) -> Result<()> {
        use ChannelData::*;

        let mut receiver = self.channels.to_mqtt.subscribe();

        loop {
            match receiver.recv().await {
                Ok(Shutdown) | Err(broadcast::error::RecvError::Closed) => {
                    info!("MQTT sender received shutdown signal");
                    let _ = client.try_publish(self.lwt_topic(), QoS::AtLeastOnce, true, "offline");
                    let _ = client.disconnect().await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("MQTT sender lagged, {} messages dropped", n);
                }
                Ok(LinkDown) => {}
                Ok(Message(message)) => self.publish(&client, message).await,
            }
        }

        info!("MQTT sender loop exiting");
        Ok(())
    }

    async fn publish(&self, client: &AsyncClient, message: Message) {
        debug!("publishing: {} = {}", message.topic, message.payload);

        for attempt in 1..=PUBLISH_ATTEMPTS {
            match client
                .publish(&message.topic, QoS::AtLeastOnce, message.retain, message.payload.as_bytes())
                .await
            {
                Ok(_) => return,
                Err(err) => {
                    error!(
                        "MQTT publish failed: {:?} (attempt {}/{})",
                        err, attempt, PUBLISH_ATTEMPTS
                    );
                    if attempt < PUBLISH_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }

        error!("giving up publishing to {}", message.topic);
    }

    fn lwt_topic(&self) -> String {
        format!("{}/LWT", self.config.mqtt().namespace())
    }
}
