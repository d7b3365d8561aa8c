// Copyright 2020 Joyent, Inc.

//! Health record of an arm plugin.
//!
//! The gate keeps one [`ArmStatus`] per plugin. It is updated from gate
//! lifecycle events and from SEND_ARM_INFO reports, and can be queried at
//! any time by the operator-facing layer.

use chrono::{DateTime, Utc};
use num_derive::{FromPrimitive, ToPrimitive};
use parking_lot::{Mutex, MutexGuard};
use serde_derive::Serialize;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, FromPrimitive, ToPrimitive)]
pub enum ArmWorkingStatus {
    Init = 0,
    Ok = 1,
    Failure = 2,
}

impl Default for ArmWorkingStatus {
    fn default() -> Self {
        ArmWorkingStatus::Init
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ArmInfo {
    pub running: bool,
    pub stat: ArmWorkingStatus,
    pub stat_update_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub num_update: u64,
    pub num_failure: u64,
    pub failure_comment: String,
}

impl ArmInfo {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn log_success(&mut self) {
        let now = Utc::now();
        self.stat = ArmWorkingStatus::Ok;
        self.stat_update_time = Some(now);
        self.last_success_time = Some(now);
        self.num_update += 1;
    }

    pub fn log_failure(&mut self, comment: &str) {
        let now = Utc::now();
        self.stat = ArmWorkingStatus::Failure;
        self.stat_update_time = Some(now);
        self.last_failure_time = Some(now);
        self.num_failure += 1;
        self.failure_comment = comment.to_string();
    }
}

/// Thread-safe holder of an [`ArmInfo`].
#[derive(Debug, Default)]
pub struct ArmStatus {
    info: Mutex<ArmInfo>,
}

impl ArmStatus {
    pub fn new() -> ArmStatus {
        ArmStatus::default()
    }

    pub fn snapshot(&self) -> ArmInfo {
        self.lock().clone()
    }

    pub fn set_running(&self, running: bool) {
        self.lock().running = running;
    }

    pub fn log_success(&self) {
        self.lock().log_success();
    }

    pub fn log_failure(&self, comment: &str) {
        self.lock().log_failure(comment);
    }

    /// Takes over the counters reported by the plugin. `running` stays
    /// under the gate's control.
    pub fn update_from_report(&self, report: &ArmInfo) {
        let mut info = self.lock();
        let running = info.running;
        *info = report.clone();
        info.running = running;
    }

    fn lock(&self) -> MutexGuard<'_, ArmInfo> {
        self.info.lock()
    }
}
