use crate::prelude::*;

use chrono::{DateTime, Local};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Sent when the armed timer for schedule `revision` goes off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduleFired {
    pub revision: u64,
}

#[derive(Default)]
struct State {
    schedule: Option<Schedule>,
    // bumped whenever the schedule is replaced or cancelled
    revision: u64,
    timer: Option<JoinHandle<()>>,
}

impl State {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Holds the single active schedule and the timer that fires it.
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<Mutex<State>>,
    file: Option<ScheduleFile>,
    fired: mpsc::UnboundedSender<ScheduleFired>,
}

impl Scheduler {
    pub fn new(file: Option<ScheduleFile>, fired: mpsc::UnboundedSender<ScheduleFired>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            file,
            fired,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the active schedule and arms its timer, unless disabled.
    pub fn set_schedule(&self, schedule: Schedule) -> Schedule {
        let next_run = schedule.start_time.next_run_after(&Local::now());
        self.install(schedule, next_run)
    }

    /// Re-arms a schedule saved by a previous run. A recurring schedule that
    /// has already run waits for its next occurrence rather than firing again.
    pub fn restore(&self, schedule: Schedule) -> Schedule {
        let now = Local::now();
        let next_run = match schedule.last_run {
            Some(_) if schedule.is_recurring() => schedule.start_time.next_occurrence_after(&now),
            _ => schedule.start_time.next_run_after(&now),
        };
        self.install(schedule, next_run)
    }

    fn install(&self, mut schedule: Schedule, next_run: DateTime<Local>) -> Schedule {
        let mut state = self.state();

        state.disarm();
        state.revision += 1;

        if schedule.enabled {
            schedule.next_run = Some(next_run);
            self.arm(&mut state, next_run);
            info!(
                "schedule set: {}% at {} ({}), next run {}",
                schedule.target_soc, schedule.start_time, schedule.mode, next_run
            );
        } else {
            schedule.next_run = None;
            info!("schedule stored disabled: {}% at {}", schedule.target_soc, schedule.start_time);
        }

        state.schedule = Some(schedule.clone());
        drop(state);

        self.persist(&schedule);
        schedule
    }

    /// Stores a schedule that is already running, without a timer.
    /// Returns the revision its session should complete against.
    pub fn adopt(&self, schedule: Schedule) -> u64 {
        let mut state = self.state();

        state.disarm();
        state.revision += 1;
        state.schedule = Some(schedule.clone());
        let revision = state.revision;
        drop(state);

        self.persist(&schedule);
        revision
    }

    /// Removes the schedule and its timer. Returns whether there was one.
    pub fn cancel(&self) -> bool {
        let mut state = self.state();

        state.disarm();
        state.revision += 1;
        let had_schedule = state.schedule.take().is_some();
        drop(state);

        self.forget();
        if had_schedule {
            info!("schedule cancelled");
        }
        had_schedule
    }

    /// Called when the timer for `revision` fires. `None` if the schedule has
    /// since been replaced or cancelled.
    pub fn begin_run(&self, revision: u64) -> Option<Schedule> {
        let mut state = self.state();

        if state.revision != revision {
            debug!("ignoring stale timer for revision {}", revision);
            return None;
        }
        state.timer = None;

        let schedule = state.schedule.as_mut().filter(|s| s.enabled)?;
        schedule.last_run = Some(Local::now());
        schedule.next_run = None;
        let schedule = schedule.clone();
        drop(state);

        self.persist(&schedule);
        Some(schedule)
    }

    /// Called when a session for `revision` is over. Recurring schedules are
    /// re-armed for their next occurrence; one-time schedules are removed.
    pub fn complete(&self, revision: u64) -> Option<Schedule> {
        let now = Local::now();
        let mut state = self.state();

        if state.revision != revision {
            debug!("ignoring completion for stale revision {}", revision);
            return None;
        }

        match state.schedule.clone() {
            Some(mut schedule) if schedule.is_recurring() && schedule.enabled => {
                let next_run = schedule.start_time.next_occurrence_after(&now);
                schedule.next_run = Some(next_run);
                state.schedule = Some(schedule.clone());
                state.disarm();
                self.arm(&mut state, next_run);
                drop(state);

                info!("recurring schedule re-armed for {}", next_run);
                self.persist(&schedule);
                Some(schedule)
            }
            Some(_) => {
                state.disarm();
                state.revision += 1;
                state.schedule = None;
                drop(state);

                info!("one-time schedule finished, cleared");
                self.forget();
                None
            }
            None => None,
        }
    }

    pub fn current(&self) -> Option<Schedule> {
        self.state().schedule.clone()
    }

    pub fn next_run(&self) -> Option<DateTime<Local>> {
        self.state().schedule.as_ref().and_then(|s| s.next_run)
    }

    pub fn revision(&self) -> u64 {
        self.state().revision
    }

    pub fn is_armed(&self) -> bool {
        self.state().timer.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Disarms the timer, leaving the schedule (and its file) for next start.
    pub fn stop(&self) {
        self.state().disarm();
    }

    fn arm(&self, state: &mut State, at: DateTime<Local>) {
        let revision = state.revision;
        // already passed means fire straight away
        let delay = (at - Local::now()).to_std().unwrap_or(Duration::ZERO);
        let fired = self.fired.clone();

        debug!("arming revision {} in {:?}", revision, delay);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if fired.send(ScheduleFired { revision }).is_err() {
                warn!("schedule fired with nobody listening");
            }
        }));
    }

    fn persist(&self, schedule: &Schedule) {
        if let Some(file) = &self.file {
            if let Err(err) = file.save(schedule) {
                error!("failed to save schedule: {}", err);
            }
        }
    }

    fn forget(&self) {
        if let Some(file) = &self.file {
            if let Err(err) = file.clear() {
                error!("failed to remove saved schedule: {}", err);
            }
        }
    }
}
