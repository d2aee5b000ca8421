//! Kernel execution state, as reported by iopub `status` messages.
//!
//! Only status messages whose parent request went out on the shell channel
//! move the state. Control-channel requests (interrupts, kernel_info requests,
//! debug traffic) also produce busy/idle pairs; those only count as evidence
//! that the kernel is alive.

use std::fmt;
use std::str::FromStr;

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::channel::Channel;
use crate::msg_id;

/// Kernel execution state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Starting,
    Idle,
    Busy,
    Restarting,
    Dead,
    /// Nothing has been observed yet. Never sent to frontends.
    #[default]
    Unknown,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Starting => "starting",
            ExecutionState::Idle => "idle",
            ExecutionState::Busy => "busy",
            ExecutionState::Restarting => "restarting",
            ExecutionState::Dead => "dead",
            ExecutionState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(ExecutionState::Starting),
            "idle" => Ok(ExecutionState::Idle),
            "busy" => Ok(ExecutionState::Busy),
            "restarting" => Ok(ExecutionState::Restarting),
            // ipykernel reports "terminating" right before exiting
            "dead" | "terminating" => Ok(ExecutionState::Dead),
            "unknown" => Ok(ExecutionState::Unknown),
            other => Err(format!("unknown execution state: {}", other)),
        }
    }
}

/// Tracks the execution state of one kernel and when it last answered.
#[derive(Debug, Default)]
pub struct StateTracker {
    state: ExecutionState,
    last_activity: Option<Instant>,
    last_shell_status: Option<Instant>,
    last_control_status: Option<Instant>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Set the state directly (connection lifecycle transitions).
    pub fn set_state(&mut self, state: ExecutionState) {
        if self.state != state {
            debug!("[kernel-client] Execution state: {} -> {}", self.state, state);
        }
        self.state = state;
        self.last_activity = Some(Instant::now());
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    pub fn last_shell_status(&self) -> Option<Instant> {
        self.last_shell_status
    }

    pub fn last_control_status(&self) -> Option<Instant> {
        self.last_control_status
    }

    /// Whether a shell or control status arrived after `since`.
    pub fn responded_since(&self, since: Instant) -> bool {
        self.last_shell_status.is_some_and(|t| t > since)
            || self.last_control_status.is_some_and(|t| t > since)
    }

    /// The state to announce to frontends, or `None` while it is unknown.
    pub fn broadcastable(&self) -> Option<ExecutionState> {
        match self.state {
            ExecutionState::Unknown => None,
            state => Some(state),
        }
    }

    /// Forget per-connection timestamps before a kernel restart.
    pub fn reset_activity(&mut self) {
        self.last_shell_status = None;
        self.last_control_status = None;
    }

    /// Apply a `status` message seen on `channel`.
    ///
    /// `parent_msg_id` is the parent header's msg_id, whose channel prefix
    /// tells which channel the triggering request was sent on.
    pub fn observe_status(
        &mut self,
        channel: Channel,
        parent_msg_id: Option<&str>,
        execution_state: Option<&str>,
    ) {
        if channel != Channel::IOPub {
            return;
        }

        let parent_channel = parent_msg_id
            .and_then(|id| msg_id::extract_channel(id).ok())
            .flatten();
        let now = Instant::now();

        match parent_channel.as_deref() {
            Some("shell") => {
                self.last_shell_status = Some(now);
                self.last_activity = Some(now);
                match execution_state.map(str::parse::<ExecutionState>) {
                    Some(Ok(state)) => self.set_state(state),
                    Some(Err(e)) => debug!("[kernel-client] Ignoring status: {}", e),
                    None => debug!("[kernel-client] Status message without execution_state"),
                }
            }
            Some("control") => {
                self.last_control_status = Some(now);
            }
            _ => {
                debug!(
                    "[kernel-client] Ignoring status message - cannot determine parent channel (state would be: {:?})",
                    execution_state
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_unknown() {
        let tracker = StateTracker::new();
        assert_eq!(tracker.state(), ExecutionState::Unknown);
        assert_eq!(tracker.broadcastable(), None);
    }

    #[test]
    fn test_shell_parent_updates_state() {
        let mut tracker = StateTracker::new();
        tracker.observe_status(Channel::IOPub, Some("shell:abc"), Some("busy"));
        assert_eq!(tracker.state(), ExecutionState::Busy);
        assert!(tracker.last_shell_status().is_some());
        assert_eq!(tracker.broadcastable(), Some(ExecutionState::Busy));

        tracker.observe_status(Channel::IOPub, Some("shell:abc#cell-1"), Some("idle"));
        assert_eq!(tracker.state(), ExecutionState::Idle);
    }

    #[test]
    fn test_control_parent_never_changes_state() {
        let mut tracker = StateTracker::new();
        tracker.observe_status(Channel::IOPub, Some("shell:abc"), Some("idle"));
        tracker.observe_status(Channel::IOPub, Some("control:def"), Some("busy"));
        assert_eq!(tracker.state(), ExecutionState::Idle);
        assert!(tracker.last_control_status().is_some());
    }

    #[test]
    fn test_unknown_parent_is_ignored() {
        let mut tracker = StateTracker::new();
        tracker.observe_status(Channel::IOPub, Some("legacy-id"), Some("busy"));
        tracker.observe_status(Channel::IOPub, None, Some("busy"));
        assert_eq!(tracker.state(), ExecutionState::Unknown);
        assert!(tracker.last_shell_status().is_none());
        assert!(tracker.last_control_status().is_none());
    }

    #[test]
    fn test_non_iopub_is_ignored() {
        let mut tracker = StateTracker::new();
        tracker.observe_status(Channel::Shell, Some("shell:abc"), Some("busy"));
        assert_eq!(tracker.state(), ExecutionState::Unknown);
    }

    #[test]
    fn test_terminating_maps_to_dead() {
        let mut tracker = StateTracker::new();
        tracker.observe_status(Channel::IOPub, Some("shell:abc"), Some("terminating"));
        assert_eq!(tracker.state(), ExecutionState::Dead);
    }

    #[test]
    fn test_responded_since_and_reset() {
        let mut tracker = StateTracker::new();
        let before = Instant::now() - std::time::Duration::from_secs(1);
        assert!(!tracker.responded_since(before));

        tracker.observe_status(Channel::IOPub, Some("control:x"), Some("idle"));
        assert!(tracker.responded_since(before));

        tracker.reset_activity();
        assert!(!tracker.responded_since(before));
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&ExecutionState::Restarting).unwrap(),
            "\"restarting\""
        );
        assert_eq!(ExecutionState::Busy.to_string(), "busy");
    }
}
