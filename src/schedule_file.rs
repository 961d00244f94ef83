use crate::prelude::*;

use std::path::{Path, PathBuf};

/// The active schedule on disk, as pretty JSON.
#[derive(Clone, Debug)]
pub struct ScheduleFile {
    path: PathBuf,
}

impl ScheduleFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, schedule: &Schedule) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|err| anyhow!("error creating {}: {}", dir.display(), err))?;
        }

        let json = serde_json::to_string_pretty(schedule)?;
        std::fs::write(&self.path, json)
            .map_err(|err| anyhow!("error writing {}: {}", self.path.display(), err))?;

        debug!("saved schedule to {}", self.path.display());
        Ok(())
    }

    /// A missing or unreadable file both mean "no schedule".
    pub fn load(&self) -> Option<Schedule> {
        if !self.path.exists() {
            return None;
        }

        match self.read() {
            Ok(schedule) => Some(schedule),
            Err(err) => {
                warn!("ignoring saved schedule: {}", err);
                None
            }
        }
    }

    fn read(&self) -> Result<Schedule> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|err| anyhow!("error reading {}: {}", self.path.display(), err))?;
        let schedule: Schedule = serde_json::from_str(&content)
            .map_err(|err| anyhow!("error parsing {}: {}", self.path.display(), err))?;
        schedule::validate_target_soc(schedule.target_soc)?;

        Ok(schedule)
    }

    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("removed {}", self.path.display());
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => bail!("error removing {}: {}", self.path.display(), err),
        }
    }
}
