use crate::prelude::*;

use std::time::Duration;

pub struct StopCharge {
    channel: CommandChannel,
}

impl StopCharge {
    pub fn new(channel: CommandChannel) -> Self {
        Self { channel }
    }

    pub fn setting(&self) -> Setting {
        Setting::ac_charge(false)
    }

    pub async fn run(&self, timeout: Duration) -> Result<(), CommandError> {
        info!("disabling AC charge");

        self.channel.send_one(&self.setting(), timeout).await?;
        Ok(())
    }
}
