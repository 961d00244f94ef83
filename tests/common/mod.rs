#![allow(dead_code)]

use solar_charge_bridge::prelude::*;

pub const DONGLE: &str = "dongle-AA:BB:CC:DD:EE:FF";

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Factory();
impl Factory {
    pub fn config_yaml() -> String {
        format!(
            r#"
mqtt:
  host: localhost
  dongle_prefix: "{}"
charging:
  safety_cutoff_hours: 8
  soc_check_interval: 30
  response_timeout: 15
  fallback_delay_ms: 500
schedule_file: null
"#,
            DONGLE
        )
    }

    pub fn config() -> ConfigWrapper {
        ConfigWrapper::from_config(Config::from_yaml(&Self::config_yaml()).unwrap())
    }

    pub fn config_with_schedule_file(path: &std::path::Path) -> ConfigWrapper {
        let yaml = Self::config_yaml().replace(
            "schedule_file: null",
            &format!("schedule_file: \"{}\"", path.display()),
        );
        ConfigWrapper::from_config(Config::from_yaml(&yaml).unwrap())
    }

    pub fn link_up() -> LinkStatus {
        let link = LinkStatus::new();
        link.set(true);
        link
    }
}

pub fn unwrap_mqtt_message(data: mqtt::ChannelData) -> mqtt::Message {
    match data {
        mqtt::ChannelData::Message(message) => message,
        other => panic!("expected a message, got {:?}", other),
    }
}

/// Next setting sent to the dongle as (key, value), skipping anything that
/// isn't an update (events, command replies).
pub async fn next_update(to_mqtt: &mut broadcast::Receiver<mqtt::ChannelData>) -> Result<(String, String)> {
    loop {
        let message = unwrap_mqtt_message(to_mqtt.recv().await?);
        if message.topic != format!("{}/update", DONGLE) {
            continue;
        }

        let v: serde_json::Value = serde_json::from_str(&message.payload)?;
        assert_eq!(v["from"], "SolarBackend");
        return Ok((
            v["setting"].as_str().unwrap().to_string(),
            v["value"].as_str().unwrap().to_string(),
        ));
    }
}

pub fn response_payload(key: &str, success: bool) -> String {
    serde_json::json!({ "setting": key, "success": success }).to_string()
}

/// A response from the dongle, as the mqtt client would deliver it.
pub fn response(key: &str, success: bool) -> mqtt::ChannelData {
    mqtt::ChannelData::Message(mqtt::Message {
        topic: format!("{}/response", DONGLE),
        retain: false,
        payload: response_payload(key, success),
    })
}

/// A telemetry message, as the mqtt client would deliver it.
pub fn telemetry(soc: Option<u8>) -> mqtt::ChannelData {
    let payload = match soc {
        Some(soc) => serde_json::json!({
            "Serialnumber": "BA12345678",
            "payload": { "SOC": soc, "Pcharge": 2500, "Pdischarge": 0 }
        }),
        None => serde_json::json!({
            "Serialnumber": "BA12345678",
            "payload": { "Pcharge": 2500, "Pdischarge": 0 }
        }),
    };

    mqtt::ChannelData::Message(mqtt::Message {
        topic: format!("{}/inputbank1", DONGLE),
        retain: false,
        payload: payload.to_string(),
    })
}

pub fn command(path: &str, payload: &str) -> mqtt::ChannelData {
    mqtt::ChannelData::Message(mqtt::Message {
        topic: format!("solar/cmd/{}", path),
        retain: false,
        payload: payload.to_string(),
    })
}

/// Plays the dongle for `count` updates, answering each with `success`.
pub async fn confirm_updates(
    channels: &Channels,
    to_mqtt: &mut broadcast::Receiver<mqtt::ChannelData>,
    count: usize,
) -> Result<Vec<(String, String)>> {
    let mut seen = Vec::with_capacity(count);
    for _ in 0..count {
        let (key, value) = next_update(to_mqtt).await?;
        channels.from_mqtt.send(response(&key, true))?;
        seen.push((key, value));
    }
    Ok(seen)
}

pub fn start_sequence(window_start: &str, window_end: &str, target_soc: u8) -> Vec<(String, String)> {
    [
        ("ACCharge", "1".to_string()),
        ("ACChgStart", window_start.to_string()),
        ("ACChgEnd", window_end.to_string()),
        ("ACChgStart1", "00:00".to_string()),
        ("ACChgEnd1", "00:00".to_string()),
        ("ACChgStart2", "00:00".to_string()),
        ("ACChgEnd2", "00:00".to_string()),
        ("ACChgMode", "4".to_string()),
        ("ACChgSOCLimit", target_soc.to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// A coordinator with its loops running and a live link.
pub async fn start_coordinator(channels: &Channels) -> Coordinator {
    start_coordinator_with(Factory::config(), channels).await
}

pub async fn start_coordinator_with(config: ConfigWrapper, channels: &Channels) -> Coordinator {
    let coordinator = Coordinator::new(config, channels.clone(), Factory::link_up());

    let c = coordinator.clone();
    tokio::spawn(async move { c.start().await });

    // wait for the receivers to subscribe
    while channels.from_mqtt.receiver_count() == 0 || channels.charge_events.receiver_count() == 0 {
        tokio::task::yield_now().await;
    }

    coordinator
}

/// Fails if anything was sent to the dongle since the last read.
pub fn assert_no_updates(to_mqtt: &mut broadcast::Receiver<mqtt::ChannelData>) {
    while let Ok(data) = to_mqtt.try_recv() {
        let message = unwrap_mqtt_message(data);
        assert_ne!(
            message.topic,
            format!("{}/update", DONGLE),
            "unexpected update {}",
            message.payload
        );
    }
}

/// Next message published on `topic`, skipping everything else.
pub async fn next_message_on(
    to_mqtt: &mut broadcast::Receiver<mqtt::ChannelData>,
    topic: &str,
) -> Result<mqtt::Message> {
    loop {
        let message = unwrap_mqtt_message(to_mqtt.recv().await?);
        if message.topic == topic {
            return Ok(message);
        }
    }
}
