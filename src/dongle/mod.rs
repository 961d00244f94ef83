//! Dongle wire formats.
//!
//! The dongle accepts one setting per `update` message, confirms each one on
//! its `response` topic and periodically publishes battery state on
//! `inputbank1`. Everything is JSON.

use crate::prelude::*;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

pub mod command_channel;

// setting keys, case-sensitive
pub const AC_CHARGE: &str = "ACCharge";
pub const AC_CHG_START: &str = "ACChgStart";
pub const AC_CHG_END: &str = "ACChgEnd";
pub const AC_CHG_START_1: &str = "ACChgStart1";
pub const AC_CHG_END_1: &str = "ACChgEnd1";
pub const AC_CHG_START_2: &str = "ACChgStart2";
pub const AC_CHG_END_2: &str = "ACChgEnd2";
pub const AC_CHG_MODE: &str = "ACChgMode";
pub const AC_CHG_SOC_LIMIT: &str = "ACChgSOCLimit";

/// Value used to switch off an unused charge window.
pub const DISABLED_WINDOW: &str = "00:00";

// Setting {{{
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Setting {
    key: String,
    value: String,
}

impl Setting {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn ac_charge(enable: bool) -> Self {
        Self::new(AC_CHARGE, if enable { "1" } else { "0" })
    }

    pub fn time(key: &str, time: chrono::NaiveTime) -> Self {
        Self::new(key, time.format("%H:%M").to_string())
    }

    pub fn charge_mode(mode: ChargeMode) -> Self {
        Self::new(AC_CHG_MODE, u8::from(mode).to_string())
    }

    pub fn soc_limit(percent: u8) -> Self {
        Self::new(AC_CHG_SOC_LIMIT, percent.to_string())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn to_update_payload(&self, source: &str) -> Result<String> {
        Ok(serde_json::to_string(&UpdateMessage {
            setting: &self.key,
            value: &self.value,
            from: source,
        })?)
    }
}

impl std::fmt::Display for Setting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
} // }}}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateMessage<'a> {
    pub setting: &'a str,
    pub value: &'a str,
    pub from: &'a str,
}

/// ACChgMode values understood by the inverter.
///
/// Only `TimeSoc` makes the inverter honour ACChgSOCLimit; in every other
/// mode the limit is ignored.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ChargeMode {
    Time = 0,
    Volt = 1,
    Soc = 2,
    TimeVolt = 3,
    TimeSoc = 4,
}

// Acknowledgment {{{
#[derive(Clone, Debug, PartialEq)]
pub struct Acknowledgment {
    pub key: String,
    pub success: bool,
    /// the full response message, including anything we don't interpret
    pub metadata: serde_json::Value,
}

impl Acknowledgment {
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let metadata: serde_json::Value = serde_json::from_slice(payload)?;

        let key = match metadata.get("setting").and_then(|s| s.as_str()) {
            Some(key) => key.to_string(),
            None => bail!("response without setting: {}", metadata),
        };
        // anything but an explicit true is a failure
        let success = metadata.get("success").and_then(|s| s.as_bool()) == Some(true);

        Ok(Self {
            key,
            success,
            metadata,
        })
    }
} // }}}

// TelemetrySample {{{
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TelemetrySample {
    pub soc: Option<u8>,
    pub charge_power: f64,
    pub discharge_power: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TelemetryMessage {
    serialnumber: String,
    #[serde(rename = "payload")]
    payload: TelemetryPayload,
}

#[derive(Deserialize)]
struct TelemetryPayload {
    #[serde(rename = "SOC")]
    soc: Option<f64>,
    #[serde(rename = "Pcharge")]
    p_charge: Option<f64>,
    #[serde(rename = "Pdischarge")]
    p_discharge: Option<f64>,
}

impl TelemetrySample {
    pub fn new(soc: Option<u8>, charge_power: f64, discharge_power: f64) -> Self {
        Self {
            soc,
            charge_power,
            discharge_power,
        }
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let message: TelemetryMessage = serde_json::from_slice(payload)?;
        trace!("telemetry from {}", message.serialnumber);
        let data = message.payload;

        let soc = match data.soc {
            // whole percent, nearest
            Some(soc) if (0.0..=100.0).contains(&soc) => Some(soc.round() as u8),
            Some(soc) => bail!("SOC out of range: {}", soc),
            None => None,
        };

        Ok(Self {
            soc,
            charge_power: data.p_charge.unwrap_or(0.0),
            discharge_power: data.p_discharge.unwrap_or(0.0),
        })
    }

    /// Signed battery power; positive while charging, negative while discharging.
    pub fn battery_power(&self) -> f64 {
        if self.discharge_power > 0.0 {
            -self.discharge_power
        } else if self.charge_power > 0.0 {
            self.charge_power
        } else {
            0.0
        }
    }
} // }}}
