//! Unit state machine
//!
//! ```text
//!     ┌─────────┐
//!     │ Created │
//!     └────┬────┘
//!          │ start
//!     ┌────▼────┐   stop    ┌─────────┐
//!     │ Running ├──────────►│ Stopped │
//!     └──┬───▲──┘           └────┬────┘
//!   exit │   │ restart (policy)  │ start
//!     ┌──▼───┴──┐                │
//!     │ Crashed │◄───────────────┘ (next exit)
//!     └────┬────┘
//!          │ remove (from any state)
//!     ┌────▼────┐
//!     │ Removed │
//!     └─────────┘
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::units::{ServiceSpec, MAX_DURATION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Created,
    Running,
    Stopped,
    Crashed,
    Removed,
}

impl UnitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
            Self::Removed => "removed",
        }
    }
}

/// Runtime state of a supervised unit
#[derive(Debug)]
pub struct RunningUnit {
    /// Definition the unit was last started from
    pub spec: Arc<ServiceSpec>,
    pub state: UnitState,
    /// Exit code of the last run
    pub exit_code: Option<i32>,
    /// Wall-clock time of the last successful start
    pub started_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    /// When the unit entered its current state
    pub state_change_time: Instant,
    /// Pending automatic restart
    pub restart_at: Option<Instant>,
    /// Automatic restarts since the last manual start
    pub restart_count: u32,
    /// Set by an explicit stop, cleared by an explicit start
    pub manually_stopped: bool,
    pub error: Option<String>,
}

impl RunningUnit {
    pub fn new(spec: Arc<ServiceSpec>) -> Self {
        Self {
            spec,
            state: UnitState::Created,
            exit_code: None,
            started_at: None,
            pid: None,
            state_change_time: Instant::now(),
            restart_at: None,
            restart_count: 0,
            manually_stopped: false,
            error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn set_running(&mut self, pid: Option<u32>) {
        self.state = UnitState::Running;
        self.pid = pid;
        self.started_at = Some(Utc::now());
        self.state_change_time = Instant::now();
        self.restart_at = None;
        self.error = None;
    }

    pub fn set_stopped(&mut self, exit_code: Option<i32>) {
        self.state = UnitState::Stopped;
        self.pid = None;
        if exit_code.is_some() {
            self.exit_code = exit_code;
        }
        self.manually_stopped = true;
        self.restart_at = None;
        self.state_change_time = Instant::now();
    }

    pub fn set_crashed(&mut self, exit_code: i32) {
        self.state = UnitState::Crashed;
        self.pid = None;
        self.exit_code = Some(exit_code);
        self.restart_at = None;
        self.state_change_time = Instant::now();
    }

    /// Record a failed launch; the unit stays (or becomes) Crashed
    pub fn set_launch_failed(&mut self, error: String) {
        self.state = UnitState::Crashed;
        self.pid = None;
        self.error = Some(error);
        self.restart_at = None;
        self.state_change_time = Instant::now();
    }

    pub fn set_removed(&mut self) {
        self.state = UnitState::Removed;
        self.pid = None;
        self.restart_at = None;
        self.state_change_time = Instant::now();
    }

    /// Schedule an automatic restart after a delay, capped at [`MAX_DURATION`]
    pub fn schedule_restart(&mut self, delay: Duration) {
        let now = Instant::now();
        let at = now
            .checked_add(delay.min(MAX_DURATION))
            .or_else(|| now.checked_add(MAX_DURATION))
            .unwrap_or(now);
        self.restart_at = Some(at);
    }

    pub fn restart_pending(&self) -> bool {
        self.restart_at.is_some()
    }

    /// Check if restart is due
    pub fn restart_due(&self) -> bool {
        self.restart_at.map(|t| Instant::now() >= t).unwrap_or(false)
    }

    /// Running, or crashed with a restart on the way
    pub fn is_active(&self) -> bool {
        self.state == UnitState::Running
            || (self.state == UnitState::Crashed && self.restart_pending())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> RunningUnit {
        RunningUnit::new(Arc::new(ServiceSpec::new("auto-rsa")))
    }

    #[test]
    fn test_unit_new() {
        let unit = unit();
        assert_eq!(unit.state, UnitState::Created);
        assert_eq!(unit.name(), "auto-rsa");
        assert!(unit.started_at.is_none());
        assert!(!unit.is_active());
    }

    #[test]
    fn test_unit_running() {
        let mut unit = unit();
        unit.set_running(Some(1234));
        assert_eq!(unit.state, UnitState::Running);
        assert_eq!(unit.pid, Some(1234));
        assert!(unit.started_at.is_some());
        assert!(unit.is_active());
    }

    #[test]
    fn test_unit_stopped() {
        let mut unit = unit();
        unit.set_running(Some(1234));
        unit.set_stopped(Some(143));
        assert_eq!(unit.state, UnitState::Stopped);
        assert_eq!(unit.exit_code, Some(143));
        assert!(unit.manually_stopped);
        assert!(unit.pid.is_none());
        assert!(!unit.is_active());
    }

    #[test]
    fn test_unit_stopped_keeps_last_exit_code() {
        let mut unit = unit();
        unit.set_crashed(2);
        unit.set_stopped(None);
        assert_eq!(unit.exit_code, Some(2));
    }

    #[test]
    fn test_unit_crashed_and_restart_schedule() {
        let mut unit = unit();
        unit.set_running(Some(1));
        unit.set_crashed(1);
        assert_eq!(unit.state, UnitState::Crashed);
        assert_eq!(unit.exit_code, Some(1));
        assert!(!unit.is_active());

        unit.schedule_restart(Duration::ZERO);
        assert!(unit.restart_pending());
        assert!(unit.restart_due());
        assert!(unit.is_active());

        unit.schedule_restart(Duration::from_secs(3600));
        assert!(!unit.restart_due());
    }

    #[test]
    fn test_huge_restart_delay_is_capped() {
        let mut unit = unit();
        unit.set_crashed(1);

        let before = Instant::now();
        unit.schedule_restart(Duration::MAX);
        assert!(unit.restart_pending());
        assert!(!unit.restart_due());
        assert!(unit.restart_at.unwrap() <= before + MAX_DURATION + Duration::from_secs(1));
    }

    #[test]
    fn test_unit_launch_failed() {
        let mut unit = unit();
        unit.set_launch_failed("no such file".to_string());
        assert_eq!(unit.state, UnitState::Crashed);
        assert_eq!(unit.error.as_deref(), Some("no such file"));
    }

    #[test]
    fn test_unit_state_as_str() {
        assert_eq!(UnitState::Created.as_str(), "created");
        assert_eq!(UnitState::Running.as_str(), "running");
        assert_eq!(UnitState::Stopped.as_str(), "stopped");
        assert_eq!(UnitState::Crashed.as_str(), "crashed");
        assert_eq!(UnitState::Removed.as_str(), "removed");
    }
}
