use crate::prelude::*;
use crate::dongle::{
    ChargeMode, AC_CHG_END, AC_CHG_END_1, AC_CHG_END_2, AC_CHG_START, AC_CHG_START_1,
    AC_CHG_START_2, DISABLED_WINDOW,
};

use chrono::{NaiveTime, TimeDelta};
use std::time::Duration;

/// Puts the inverter into time+SOC AC charging.
///
/// The order of the settings matters to the inverter: ACChgMode has to be
/// in place before ACChgSOCLimit or the limit is ignored.
pub struct StartCharge {
    channel: CommandChannel,
    window_start: NaiveTime,
    window_hours: u32,
    target_soc: u8,
}

impl StartCharge {
    pub fn new(
        channel: CommandChannel,
        window_start: NaiveTime,
        window_hours: u32,
        target_soc: u8,
    ) -> Self {
        Self {
            channel,
            window_start,
            window_hours,
            target_soc,
        }
    }

    pub fn window_end(&self) -> NaiveTime {
        // wraps past midnight
        self.window_start + TimeDelta::hours(i64::from(self.window_hours))
    }

    pub fn settings(&self) -> Vec<Setting> {
        vec![
            Setting::ac_charge(true),
            Setting::time(AC_CHG_START, self.window_start),
            Setting::time(AC_CHG_END, self.window_end()),
            // unused windows keep whatever was there last unless zeroed
            Setting::new(AC_CHG_START_1, DISABLED_WINDOW),
            Setting::new(AC_CHG_END_1, DISABLED_WINDOW),
            Setting::new(AC_CHG_START_2, DISABLED_WINDOW),
            Setting::new(AC_CHG_END_2, DISABLED_WINDOW),
            Setting::charge_mode(ChargeMode::TimeSoc),
            Setting::soc_limit(self.target_soc),
        ]
    }

    pub async fn run(&self, timeout: Duration) -> Result<(), CommandError> {
        info!(
            "enabling AC charge to {}% between {} and {}",
            self.target_soc,
            self.window_start.format("%H:%M"),
            self.window_end().format("%H:%M")
        );

        self.channel.send_sequence(&self.settings(), timeout).await
    }
}
