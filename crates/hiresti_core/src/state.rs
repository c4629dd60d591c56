//! Output State Machine
//!
//! Sole owner of [`OutputState`]. Every change goes through here and comes
//! back as a [`Transition`] for the host and the event log.
//!
//! ```text
//!            set_output
//! Idle ───────────────► Switching ──► Active
//!   ▲                      │   ▲        │ device lost
//!   │                      │   │        ▼
//!   │                      ├───┼──► Fallback(reason)
//!   │                      │   │        │
//!   │                      └───┼──► Error(reason)
//!   │                          │        │
//!   └──────── reset            └────────┘ set_output / recover
//! ```
//!
//! Completions carry the request id they were issued for; a completion for
//! anything but the latest request is stale and changes nothing.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use hiresti_platform::Driver;

use crate::model::{OutputRequest, OutputState};

/// Reason used when the selected device vanished
pub const DISCONNECTED: &str = "disconnected";

/// One observable state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub prev: OutputState,
    pub next: OutputState,
    pub detail: String,
    pub request_id: u64,
}

impl Transition {
    /// Event log line for this change
    pub fn log_line(&self) -> String {
        if self.detail.is_empty() {
            format!("Output: {} -> {}", self.prev.as_str(), self.next)
        } else {
            format!("Output: {} -> {} ({})", self.prev.as_str(), self.next, self.detail)
        }
    }
}

/// How a reconfiguration ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Sink acquired as requested
    Applied,
    /// Audio flows, but not as requested
    Degraded(String),
    /// No usable output
    Failed(String),
}

#[derive(Debug, Clone)]
struct InFlight {
    id: u64,
    request: OutputRequest,
    /// Internal rebind after device loss; completes into Fallback
    rebind: bool,
    started: Instant,
}

#[derive(Debug, Default)]
pub struct OutputStateMachine {
    state: OutputState,
    requested: Option<OutputRequest>,
    applied: Option<OutputRequest>,
    in_flight: Option<InFlight>,
    /// Fallback reason surfaced before the sink settled (PipeWire rate block)
    pending_fallback: Option<String>,
    next_id: u64,
    last_disconnected: Option<(Driver, String)>,
    cooldown_until: Option<Instant>,
}

impl OutputStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &OutputState {
        &self.state
    }

    /// The user's target, used by Recover
    pub fn requested(&self) -> Option<&OutputRequest> {
        self.requested.as_ref()
    }

    /// What the sink currently runs on
    pub fn applied(&self) -> Option<&OutputRequest> {
        self.applied.as_ref()
    }

    pub fn in_flight(&self) -> Option<(u64, &OutputRequest, Instant)> {
        self.in_flight
            .as_ref()
            .map(|f| (f.id, &f.request, f.started))
    }

    pub fn is_current(&self, request_id: u64) -> bool {
        self.in_flight.as_ref().map(|f| f.id) == Some(request_id)
    }

    pub fn can_recover(&self) -> bool {
        self.state.is_recoverable() && self.requested.is_some()
    }

    fn move_to(&mut self, next: OutputState, detail: &str, request_id: u64) -> Option<Transition> {
        if next == self.state {
            return None;
        }
        let prev = std::mem::replace(&mut self.state, next.clone());
        debug!("Output state {} -> {}", prev, next);
        Some(Transition {
            prev,
            next,
            detail: detail.to_string(),
            request_id,
        })
    }

    fn issue(&mut self, request: OutputRequest, rebind: bool) -> u64 {
        self.next_id += 1;
        self.in_flight = Some(InFlight {
            id: self.next_id,
            request,
            rebind,
            started: Instant::now(),
        });
        self.pending_fallback = None;
        self.next_id
    }

    /// A user-initiated switch: record it and enter Switching
    pub fn begin(&mut self, request: OutputRequest, detail: &str) -> (u64, Option<Transition>) {
        self.requested = Some(request.clone());
        let id = self.issue(request, false);
        let transition = self.move_to(OutputState::Switching, detail, id);
        (id, transition)
    }

    /// Re-open the applied request while the session clock follows a new
    /// source rate; only from Active with nothing in flight
    pub fn renegotiate(&mut self, detail: &str) -> Option<(u64, Option<Transition>)> {
        if self.in_flight.is_some() || self.state != OutputState::Active {
            return None;
        }
        let request = self.applied.clone()?;
        let id = self.issue(request, false);
        let transition = self.move_to(OutputState::Switching, detail, id);
        Some((id, transition))
    }

    /// Rebind to a substitute device after a loss; the state stays Fallback
    pub fn begin_rebind(&mut self, request: OutputRequest) -> u64 {
        self.issue(request, true)
    }

    /// Surface a fallback reason for the in-flight request before it settles
    pub fn degrade(&mut self, request_id: u64, reason: &str) -> Option<Transition> {
        if !self.is_current(request_id) {
            return None;
        }
        self.pending_fallback = Some(reason.to_string());
        self.move_to(OutputState::Fallback(reason.to_string()), reason, request_id)
    }

    /// Settle the request `request_id`; stale ids are ignored
    pub fn complete(&mut self, request_id: u64, completion: Completion) -> Option<Transition> {
        if !self.is_current(request_id) {
            debug!("Discarding stale output completion #{}", request_id);
            return None;
        }
        let Some(flight) = self.in_flight.take() else {
            return None;
        };
        let pending = self.pending_fallback.take();
        match completion {
            Completion::Applied => {
                self.applied = Some(flight.request);
                if flight.rebind {
                    self.move_to(
                        OutputState::Fallback(DISCONNECTED.to_string()),
                        "rebound to substitute device",
                        request_id,
                    )
                } else if let Some(reason) = pending {
                    self.move_to(OutputState::Fallback(reason.clone()), &reason, request_id)
                } else {
                    self.move_to(OutputState::Active, "", request_id)
                }
            }
            Completion::Degraded(reason) => {
                self.applied = Some(flight.request);
                self.move_to(OutputState::Fallback(reason.clone()), &reason, request_id)
            }
            Completion::Failed(reason) => {
                self.applied = None;
                self.move_to(OutputState::Error(reason.clone()), &reason, request_id)
            }
        }
    }

    /// Unrecoverable runtime error outside a reconfiguration
    pub fn fail(&mut self, reason: &str) -> Option<Transition> {
        self.in_flight = None;
        self.pending_fallback = None;
        self.move_to(OutputState::Error(reason.to_string()), reason, 0)
    }

    /// Runtime degradation outside a reconfiguration
    pub fn fall_back(&mut self, reason: &str) -> Option<Transition> {
        self.move_to(OutputState::Fallback(reason.to_string()), reason, 0)
    }

    /// The applied device vanished
    ///
    /// Only meaningful while audio flows; records the sticky pair used for
    /// switch-back.
    pub fn device_lost(&mut self, driver: Driver, device_name: &str) -> Option<Transition> {
        let flowing = match &self.state {
            OutputState::Active => true,
            OutputState::Fallback(reason) => reason != DISCONNECTED,
            _ => false,
        };
        if !flowing {
            return None;
        }
        self.last_disconnected = Some((driver, device_name.to_string()));
        self.in_flight = None;
        self.move_to(
            OutputState::Fallback(DISCONNECTED.to_string()),
            &format!("{} lost", device_name),
            0,
        )
    }

    pub fn reset(&mut self) -> Option<Transition> {
        self.in_flight = None;
        self.pending_fallback = None;
        self.applied = None;
        self.move_to(OutputState::Idle, "", 0)
    }

    pub fn last_disconnected(&self) -> Option<&(Driver, String)> {
        self.last_disconnected.as_ref()
    }

    pub fn clear_last_disconnected(&mut self) {
        self.last_disconnected = None;
    }

    pub fn arm_cooldown(&mut self, now: Instant, duration: Duration) {
        self.cooldown_until = Some(now + duration);
    }

    /// Time left before another automatic switch-back is allowed
    pub fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        self.cooldown_until
            .and_then(|until| until.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alsa(name: &str, id: &str) -> OutputRequest {
        OutputRequest {
            driver: Driver::Alsa,
            device_id: Some(id.to_string()),
            device_name: name.to_string(),
            bit_perfect: true,
            exclusive: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_switch_to_active() {
        let mut sm = OutputStateMachine::new();
        let (id, t) = sm.begin(alsa("USB DAC", "hw:1,0"), "user");
        let t = t.unwrap();
        assert_eq!(t.prev, OutputState::Idle);
        assert_eq!(t.next, OutputState::Switching);
        let t = sm.complete(id, Completion::Applied).unwrap();
        assert_eq!(t.next, OutputState::Active);
        assert_eq!(sm.applied().unwrap().device_name, "USB DAC");
        assert_eq!(t.log_line(), "Output: switching -> active");
    }

    #[test]
    fn test_renegotiate_passes_through_switching() {
        let mut sm = OutputStateMachine::new();
        assert!(sm.renegotiate("clock").is_none(), "nothing applied yet");
        let (id, _) = sm.begin(alsa("USB DAC", "hw:1,0"), "user");
        assert!(sm.renegotiate("clock").is_none(), "still in flight");
        sm.complete(id, Completion::Applied);

        let (id, t) = sm.renegotiate("clock").unwrap();
        let t = t.unwrap();
        assert_eq!(t.prev, OutputState::Active);
        assert_eq!(t.next, OutputState::Switching);
        let t = sm
            .complete(id, Completion::Degraded("rate blocked".into()))
            .unwrap();
        assert_eq!(t.prev, OutputState::Switching);
        assert_eq!(t.next, OutputState::Fallback("rate blocked".into()));
        assert_eq!(sm.applied().unwrap().device_name, "USB DAC");
    }

    #[test]
    fn test_stale_completion_ignored() {
        let mut sm = OutputStateMachine::new();
        let (first, _) = sm.begin(alsa("A", "hw:1,0"), "");
        let (second, t) = sm.begin(alsa("B", "hw:2,0"), "");
        assert!(t.is_none(), "already switching");
        assert!(sm.complete(first, Completion::Failed("late".into())).is_none());
        assert_eq!(sm.state(), &OutputState::Switching);
        sm.complete(second, Completion::Applied);
        assert_eq!(sm.state(), &OutputState::Active);
    }

    #[test]
    fn test_degrade_sticks_through_completion() {
        let mut sm = OutputStateMachine::new();
        let (id, _) = sm.begin(OutputRequest::default(), "");
        let t = sm.degrade(id, "PipeWire rate blocked").unwrap();
        assert_eq!(t.prev, OutputState::Switching);
        assert_eq!(t.next, OutputState::Fallback("PipeWire rate blocked".into()));
        assert!(sm.complete(id, Completion::Applied).is_none());
        assert_eq!(sm.state().reason(), Some("PipeWire rate blocked"));
        assert!(sm.can_recover());
    }

    #[test]
    fn test_failure_and_recover() {
        let mut sm = OutputStateMachine::new();
        let (id, _) = sm.begin(alsa("A", "hw:1,0"), "");
        let t = sm.complete(id, Completion::Failed("No output".into())).unwrap();
        assert_eq!(t.next, OutputState::Error("No output".into()));
        assert!(sm.applied().is_none());
        assert!(sm.can_recover());
        let (id, _) = sm.begin(sm.requested().unwrap().clone(), "recover");
        sm.complete(id, Completion::Applied);
        assert_eq!(sm.state(), &OutputState::Active);
    }

    #[test]
    fn test_device_loss_and_rebind() {
        let mut sm = OutputStateMachine::new();
        let (id, _) = sm.begin(alsa("USB DAC", "hw:1,0"), "");
        sm.complete(id, Completion::Applied);

        let t = sm.device_lost(Driver::Alsa, "USB DAC").unwrap();
        assert_eq!(t.next, OutputState::Fallback(DISCONNECTED.into()));
        assert_eq!(
            sm.last_disconnected(),
            Some(&(Driver::Alsa, "USB DAC".to_string()))
        );
        // Second loss report is a no-op
        assert!(sm.device_lost(Driver::Alsa, "USB DAC").is_none());

        let id = sm.begin_rebind(alsa("Onboard", "hw:0,0"));
        assert!(sm.complete(id, Completion::Applied).is_none());
        assert_eq!(sm.state().reason(), Some(DISCONNECTED));
        assert_eq!(sm.applied().unwrap().device_name, "Onboard");
        assert_eq!(sm.requested().unwrap().device_name, "USB DAC");
    }

    #[test]
    fn test_cooldown() {
        let mut sm = OutputStateMachine::new();
        let now = Instant::now();
        assert!(sm.cooldown_remaining(now).is_none());
        sm.arm_cooldown(now, Duration::from_secs(15));
        assert!(sm.cooldown_remaining(now + Duration::from_secs(5)).is_some());
        assert!(sm.cooldown_remaining(now + Duration::from_secs(16)).is_none());
    }
}
