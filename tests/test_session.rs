mod common;
use common::*;
use solar_charge_bridge::coordinator::session::{
    ChargeEvent, ChargeState, SessionError, StartOutcome, StopReason,
};
use solar_charge_bridge::prelude::*;

use chrono::{NaiveTime, TimeDelta};
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);

// enable_immediate with the dongle confirming every setting
async fn start_charging(
    coordinator: &Coordinator,
    channels: &Channels,
    to_mqtt: &mut broadcast::Receiver<mqtt::ChannelData>,
    soc: Option<u8>,
    target_soc: u8,
) {
    if soc.is_some() {
        coordinator.tracker().ingest(TelemetrySample::new(soc, 0.0, 0.0));
    }

    let sf = async {
        assert_eq!(coordinator.enable_immediate(target_soc).await?, StartOutcome::Charging);
        Ok::<(), anyhow::Error>(())
    };
    let tf = async {
        confirm_updates(channels, to_mqtt, 9).await?;
        Ok::<(), anyhow::Error>(())
    };

    futures::try_join!(tf, sf).unwrap();
    assert!(coordinator.session().is_charging());
}

async fn feed(channels: &Channels, soc: Option<u8>) {
    channels.from_mqtt.send(telemetry(soc)).unwrap();
    tokio::time::sleep(MINUTE).await;
}

fn disable() -> Vec<(String, String)> {
    vec![("ACCharge".to_string(), "0".to_string())]
}

#[tokio::test(start_paused = true)]
async fn enable_immediate_end_to_end() {
    common_setup();

    let channels = Channels::new();
    let coordinator = start_coordinator(&channels).await;
    let mut to_mqtt = channels.to_mqtt.subscribe();
    let mut events = channels.charge_events.subscribe();

    coordinator.tracker().ingest(TelemetrySample::new(Some(50), 0.0, 0.0));

    let sf = async {
        assert_eq!(coordinator.enable_immediate(80).await?, StartOutcome::Charging);
        Ok::<(), anyhow::Error>(())
    };

    let tf = async {
        let seen = confirm_updates(&channels, &mut to_mqtt, 9).await?;

        let keys: Vec<&str> = seen.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "ACCharge",
                "ACChgStart",
                "ACChgEnd",
                "ACChgStart1",
                "ACChgEnd1",
                "ACChgStart2",
                "ACChgEnd2",
                "ACChgMode",
                "ACChgSOCLimit"
            ]
        );
        assert_eq!(seen[0].1, "1");
        assert_eq!(seen[3..], start_sequence("", "", 80)[3..]);

        // window is now until now + 8h
        let start = NaiveTime::parse_from_str(&seen[1].1, "%H:%M")?;
        let end = NaiveTime::parse_from_str(&seen[2].1, "%H:%M")?;
        assert_eq!(end, start + TimeDelta::hours(8));

        Ok::<(), anyhow::Error>(())
    };

    futures::try_join!(tf, sf).unwrap();

    assert!(coordinator.session().is_charging());
    assert_eq!(
        events.recv().await.unwrap(),
        ChargeEvent::Started {
            target_soc: 80,
            soc: Some(50)
        }
    );

    channels.from_mqtt.send(telemetry(Some(80))).unwrap();
    assert_eq!(confirm_updates(&channels, &mut to_mqtt, 1).await.unwrap(), disable());

    assert_eq!(
        events.recv().await.unwrap(),
        ChargeEvent::Completed {
            target_soc: 80,
            final_soc: Some(80),
            reason: StopReason::TargetReached
        }
    );
    assert_eq!(coordinator.session().state(), ChargeState::Idle);
    // immediate sessions are one-time
    assert_eq!(coordinator.current_schedule(), None);
}

#[tokio::test(start_paused = true)]
async fn stops_exactly_at_target() {
    common_setup();

    let channels = Channels::new();
    let coordinator = start_coordinator(&channels).await;
    let mut to_mqtt = channels.to_mqtt.subscribe();

    start_charging(&coordinator, &channels, &mut to_mqtt, Some(70), 80).await;

    for soc in [75, 79] {
        feed(&channels, Some(soc)).await;
        assert_no_updates(&mut to_mqtt);
        assert!(coordinator.session().is_charging());
    }

    channels.from_mqtt.send(telemetry(Some(80))).unwrap();
    assert_eq!(confirm_updates(&channels, &mut to_mqtt, 1).await.unwrap(), disable());
}

#[tokio::test(start_paused = true)]
async fn unknown_soc_never_stops() {
    common_setup();

    let channels = Channels::new();
    let coordinator = start_coordinator(&channels).await;
    let mut to_mqtt = channels.to_mqtt.subscribe();

    start_charging(&coordinator, &channels, &mut to_mqtt, Some(70), 80).await;

    for _ in 0..2 {
        feed(&channels, None).await;
        assert_no_updates(&mut to_mqtt);
        assert!(coordinator.session().is_charging());
    }
    assert_eq!(coordinator.tracker().soc(), Some(70));

    channels.from_mqtt.send(telemetry(Some(81))).unwrap();
    assert_eq!(confirm_updates(&channels, &mut to_mqtt, 1).await.unwrap(), disable());
}

#[tokio::test(start_paused = true)]
async fn unknown_soc_at_start_still_charges() {
    common_setup();

    let channels = Channels::new();
    let coordinator = start_coordinator(&channels).await;
    let mut to_mqtt = channels.to_mqtt.subscribe();

    start_charging(&coordinator, &channels, &mut to_mqtt, None, 60).await;

    feed(&channels, None).await;
    assert_no_updates(&mut to_mqtt);
    assert!(coordinator.session().is_charging());
}

#[tokio::test(start_paused = true)]
async fn failed_sequence_never_charges() {
    common_setup();

    let channels = Channels::new();
    let coordinator = start_coordinator(&channels).await;
    let mut to_mqtt = channels.to_mqtt.subscribe();
    let mut events = channels.charge_events.subscribe();

    coordinator.tracker().ingest(TelemetrySample::new(Some(50), 0.0, 0.0));

    let sf = async {
        let result = coordinator.enable_immediate(80).await;
        assert_eq!(
            result,
            Err(SessionError::Sequence(CommandError::SequenceIncomplete {
                failed: vec!["ACChgMode".to_string()]
            }))
        );
        Ok::<(), anyhow::Error>(())
    };

    let tf = async {
        for _ in 0..9 {
            let (key, _) = next_update(&mut to_mqtt).await?;
            assert_ne!(coordinator.session().state(), ChargeState::Charging);
            channels.from_mqtt.send(response(&key, key != "ACChgMode"))?;
        }
        Ok::<(), anyhow::Error>(())
    };

    futures::try_join!(tf, sf).unwrap();

    assert_eq!(coordinator.session().state(), ChargeState::Idle);
    assert!(matches!(
        events.recv().await.unwrap(),
        ChargeEvent::StartFailed { target_soc: 80, .. }
    ));

    // no monitor means nothing ever disables
    tokio::time::sleep(Duration::from_secs(9 * 3600)).await;
    assert_no_updates(&mut to_mqtt);
    assert_eq!(coordinator.current_schedule(), None);
}

#[tokio::test(start_paused = true)]
async fn transport_down_fails_start() {
    common_setup();

    let channels = Channels::new();
    let link = LinkStatus::new();
    let coordinator = Coordinator::new(Factory::config(), channels.clone(), link);
    let mut to_mqtt = channels.to_mqtt.subscribe();

    let result = coordinator.enable_immediate(80).await;

    assert!(matches!(
        result,
        Err(SessionError::Sequence(CommandError::SequenceIncomplete { ref failed })) if failed.len() == 9
    ));
    assert_no_updates(&mut to_mqtt);
    assert!(!coordinator.session().is_charging());
}

#[tokio::test(start_paused = true)]
async fn already_at_target_skips_the_dongle() {
    common_setup();

    let channels = Channels::new();
    let coordinator = start_coordinator(&channels).await;
    let mut to_mqtt = channels.to_mqtt.subscribe();
    let mut events = channels.charge_events.subscribe();

    coordinator.tracker().ingest(TelemetrySample::new(Some(85), 0.0, 0.0));

    assert_eq!(
        coordinator.enable_immediate(80).await.unwrap(),
        StartOutcome::AlreadyAtTarget { soc: 85 }
    );

    assert_no_updates(&mut to_mqtt);
    assert_eq!(
        events.recv().await.unwrap(),
        ChargeEvent::Skipped {
            target_soc: 80,
            soc: 85
        }
    );
    assert_eq!(coordinator.session().state(), ChargeState::Idle);
    assert_eq!(coordinator.current_schedule(), None);
}

#[tokio::test(start_paused = true)]
async fn invalid_target_is_rejected() {
    common_setup();

    let channels = Channels::new();
    let coordinator = start_coordinator(&channels).await;
    let mut to_mqtt = channels.to_mqtt.subscribe();

    assert_eq!(
        coordinator.enable_immediate(5).await,
        Err(SessionError::InvalidTarget(5))
    );
    assert_eq!(
        coordinator.enable_immediate(101).await,
        Err(SessionError::InvalidTarget(101))
    );
    assert_no_updates(&mut to_mqtt);
}

#[tokio::test(start_paused = true)]
async fn safety_cutoff() {
    common_setup();

    let channels = Channels::new();
    let coordinator = start_coordinator(&channels).await;
    let mut to_mqtt = channels.to_mqtt.subscribe();
    let mut events = channels.charge_events.subscribe();

    start_charging(&coordinator, &channels, &mut to_mqtt, Some(50), 90).await;
    let started = tokio::time::Instant::now();

    // no telemetry at all; the cutoff alone ends it
    assert_eq!(confirm_updates(&channels, &mut to_mqtt, 1).await.unwrap(), disable());
    assert!(started.elapsed() >= Duration::from_secs(8 * 3600));

    assert!(matches!(events.recv().await.unwrap(), ChargeEvent::Started { .. }));
    assert_eq!(
        events.recv().await.unwrap(),
        ChargeEvent::Completed {
            target_soc: 90,
            final_soc: Some(50),
            reason: StopReason::SafetyCutoff
        }
    );
    assert_eq!(coordinator.session().state(), ChargeState::Idle);
}

#[tokio::test(start_paused = true)]
async fn new_session_supersedes_old_monitor() {
    common_setup();

    let channels = Channels::new();
    let coordinator = start_coordinator(&channels).await;
    let mut to_mqtt = channels.to_mqtt.subscribe();

    start_charging(&coordinator, &channels, &mut to_mqtt, Some(70), 80).await;
    start_charging(&coordinator, &channels, &mut to_mqtt, None, 90).await;
    assert_eq!(coordinator.session().snapshot().target_soc, Some(90));

    // the first session's monitor would have stopped here
    feed(&channels, Some(85)).await;
    assert_no_updates(&mut to_mqtt);
    assert!(coordinator.session().is_charging());

    channels.from_mqtt.send(telemetry(Some(90))).unwrap();
    assert_eq!(confirm_updates(&channels, &mut to_mqtt, 1).await.unwrap(), disable());

    // and exactly one disable was sent
    tokio::time::sleep(Duration::from_secs(9 * 3600)).await;
    assert_no_updates(&mut to_mqtt);
}

#[tokio::test(start_paused = true)]
async fn superseding_start_at_target_disables_charging() {
    common_setup();

    let channels = Channels::new();
    let coordinator = start_coordinator(&channels).await;
    let mut to_mqtt = channels.to_mqtt.subscribe();

    start_charging(&coordinator, &channels, &mut to_mqtt, Some(60), 90).await;

    let sf = async { Ok::<StartOutcome, anyhow::Error>(coordinator.enable_immediate(50).await?) };
    let tf = async { confirm_updates(&channels, &mut to_mqtt, 1).await };

    let (seen, outcome) = futures::try_join!(tf, sf).unwrap();
    assert_eq!(outcome, StartOutcome::AlreadyAtTarget { soc: 60 });
    assert_eq!(seen, disable());
    assert_eq!(coordinator.session().state(), ChargeState::Idle);

    tokio::time::sleep(Duration::from_secs(9 * 3600)).await;
    assert_no_updates(&mut to_mqtt);
}

#[tokio::test(start_paused = true)]
async fn superseding_start_that_fails_disables_charging() {
    common_setup();

    let channels = Channels::new();
    let coordinator = start_coordinator(&channels).await;
    let mut to_mqtt = channels.to_mqtt.subscribe();

    start_charging(&coordinator, &channels, &mut to_mqtt, Some(60), 80).await;

    let sf = async {
        assert!(matches!(
            coordinator.enable_immediate(90).await,
            Err(SessionError::Sequence(CommandError::SequenceIncomplete { .. }))
        ));
        Ok::<(), anyhow::Error>(())
    };

    let tf = async {
        for _ in 0..9 {
            let (key, _) = next_update(&mut to_mqtt).await?;
            channels.from_mqtt.send(response(&key, key != "ACChgSOCLimit"))?;
        }
        // the old session's charging is switched off
        confirm_updates(&channels, &mut to_mqtt, 1).await
    };

    let (seen, _) = futures::try_join!(tf, sf).unwrap();
    assert_eq!(seen, disable());
    assert_eq!(coordinator.session().state(), ChargeState::Idle);

    tokio::time::sleep(Duration::from_secs(9 * 3600)).await;
    assert_no_updates(&mut to_mqtt);
}

#[tokio::test(start_paused = true)]
async fn disable_when_idle_is_a_no_op() {
    common_setup();

    let channels = Channels::new();
    let coordinator = start_coordinator(&channels).await;
    let mut to_mqtt = channels.to_mqtt.subscribe();

    assert_eq!(coordinator.disable_immediate().await, Ok(false));
    assert_eq!(coordinator.disable_immediate().await, Ok(false));

    assert_no_updates(&mut to_mqtt);
}

#[tokio::test(start_paused = true)]
async fn disable_while_charging() {
    common_setup();

    let channels = Channels::new();
    let coordinator = start_coordinator(&channels).await;
    let mut to_mqtt = channels.to_mqtt.subscribe();
    let mut events = channels.charge_events.subscribe();

    start_charging(&coordinator, &channels, &mut to_mqtt, Some(60), 80).await;

    let sf = async {
        assert!(coordinator.disable_immediate().await?);
        Ok::<(), anyhow::Error>(())
    };
    let tf = async {
        assert_eq!(confirm_updates(&channels, &mut to_mqtt, 1).await?, disable());
        Ok::<(), anyhow::Error>(())
    };
    futures::try_join!(tf, sf).unwrap();

    assert_eq!(coordinator.session().state(), ChargeState::Idle);
    assert!(matches!(events.recv().await.unwrap(), ChargeEvent::Started { .. }));
    assert_eq!(
        events.recv().await.unwrap(),
        ChargeEvent::Stopped {
            target_soc: 80,
            soc: Some(60),
            reason: StopReason::Cancelled
        }
    );
    assert_eq!(coordinator.current_schedule(), None);

    // monitor is gone: reaching the old target sends nothing
    feed(&channels, Some(95)).await;
    assert_no_updates(&mut to_mqtt);
    assert_eq!(coordinator.disable_immediate().await, Ok(false));
}
