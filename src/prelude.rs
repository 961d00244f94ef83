pub use anyhow::{anyhow, bail, Error, Result};
pub use log::{debug, error, info, trace, warn};
pub use std::str::FromStr;
pub use tokio::sync::{broadcast, mpsc, oneshot, watch};

pub use crate::{
    channels::Channels,
    command::Command,
    config::{self, Config, ConfigWrapper},
    coordinator::{self, Coordinator},
    dongle::{self, command_channel::CommandChannel, Acknowledgment, Setting, TelemetrySample},
    error::CommandError,
    mqtt::{self, LinkStatus},
    options::Options,
    schedule::{self, Schedule, ScheduleMode, ScheduleRequest, StartSpec},
    schedule_file::ScheduleFile,
    scheduler::Scheduler,
    soc_tracker::SocTracker,
};
