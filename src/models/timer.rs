use serde::{Deserialize, Serialize};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TimerStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Start,
    Pause,
    Complete,
    Stop,
}

impl TimerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerEvent::Start => "start",
            TimerEvent::Pause => "pause",
            TimerEvent::Complete => "complete",
            TimerEvent::Stop => "stop",
        }
    }
}

impl TimerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerStatus::Idle => "Idle",
            TimerStatus::Running => "Running",
            TimerStatus::Paused => "Paused",
            TimerStatus::Completed => "Completed",
            TimerStatus::Stopped => "Stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TimerStatus::Completed | TimerStatus::Stopped)
    }

    pub fn transition(self, event: TimerEvent) -> Result<TimerStatus, SyncError> {
        use TimerEvent as E;
        use TimerStatus as S;

        let next = match (self, event) {
            (S::Idle | S::Paused, E::Start) => S::Running,
            (S::Running, E::Pause) => S::Paused,
            (S::Running | S::Paused, E::Complete) => S::Completed,
            (S::Idle | S::Running | S::Paused, E::Stop) => S::Stopped,
            (from, event) => {
                return Err(SyncError::InvalidTransition {
                    from: from.as_str(),
                    event: event.as_str(),
                })
            }
        };
        Ok(next)
    }
}

/// Durable state of one timer, keyed by the widget instance that owns it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimerSessionState {
    pub habit_id: String,
    pub widget_instance_id: String,
    pub elapsed_seconds: u64,
    pub is_running: bool,
    pub is_countdown: bool,
    #[serde(default)]
    pub target_seconds: u64,
    /// Epoch millis of the last persisted tick (or start/pause).
    pub last_tick_at: i64,
    /// Id of the keeper that last started, resumed or paused the session.
    /// Only that keeper's tick loop may write while it is running.
    #[serde(default)]
    pub owner: String,
}

impl TimerSessionState {
    pub fn status(&self) -> TimerStatus {
        if self.is_running {
            TimerStatus::Running
        } else {
            TimerStatus::Paused
        }
    }

    pub fn reached_target(&self) -> bool {
        self.is_countdown && self.target_seconds > 0 && self.elapsed_seconds >= self.target_seconds
    }

    pub fn remaining_seconds(&self) -> u64 {
        self.target_seconds.saturating_sub(self.elapsed_seconds)
    }

    /// Advance by one logical second.
    pub fn tick(&mut self, now_ms: i64) {
        self.elapsed_seconds = self.elapsed_seconds.saturating_add(1);
        self.last_tick_at = now_ms;
    }
}

pub fn format_clock(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let running = TimerStatus::Idle.transition(TimerEvent::Start).unwrap();
        assert_eq!(running, TimerStatus::Running);
        let paused = running.transition(TimerEvent::Pause).unwrap();
        assert_eq!(paused, TimerStatus::Paused);
        let resumed = paused.transition(TimerEvent::Start).unwrap();
        assert_eq!(resumed.transition(TimerEvent::Complete).unwrap(), TimerStatus::Completed);
    }

    #[test]
    fn terminal_states_reject_events() {
        assert!(TimerStatus::Completed.transition(TimerEvent::Start).is_err());
        assert!(TimerStatus::Stopped.transition(TimerEvent::Stop).is_err());
        assert!(TimerStatus::Paused.transition(TimerEvent::Pause).is_err());
        assert!(TimerStatus::Idle.transition(TimerEvent::Complete).is_err());
    }

    #[test]
    fn countdown_reaches_target() {
        let mut state = TimerSessionState {
            habit_id: "h".into(),
            widget_instance_id: "w".into(),
            elapsed_seconds: 58,
            is_running: true,
            is_countdown: true,
            target_seconds: 60,
            last_tick_at: 0,
            owner: String::new(),
        };
        state.tick(1000);
        assert!(!state.reached_target());
        state.tick(2000);
        assert!(state.reached_target());
        assert_eq!(state.remaining_seconds(), 0);
        assert_eq!(state.last_tick_at, 2000);
    }

    #[test]
    fn clock_formatting() {
        assert_eq!(format_clock(0), "00:00");
        assert_eq!(format_clock(125), "02:05");
    }
}
