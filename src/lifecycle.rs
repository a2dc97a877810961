// Lifecycle state machine shared between the controller and the probes
// Transitions only move forward; the controller serializes them behind its own lock

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LifecycleState {
    Initialized = 0,
    Starting = 1,
    Running = 2,
    Closing = 3,
    Closed = 4,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Initialized,
            1 => LifecycleState::Starting,
            2 => LifecycleState::Running,
            3 => LifecycleState::Closing,
            _ => LifecycleState::Closed,
        }
    }

    /// Whether `self -> next` is a legal step.
    ///
    /// `Starting -> Initialized` is the one backwards edge: a failed start rolls
    /// back so the caller may retry.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Initialized, Starting)
                | (Starting, Running)
                | (Starting, Initialized)
                | (Initialized, Closed)
                | (Running, Closing)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Initialized => "initialized",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Closing => "closing",
            LifecycleState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Lock-free view of the lifecycle read by `/ready`, plus the per-listener
/// serving flags the loops maintain.
#[derive(Debug)]
pub struct ServerStatus {
    state: AtomicU8,
    mounted: AtomicBool,
    http_serving: AtomicBool,
    grpc_serving: AtomicBool,
}

impl Default for ServerStatus {
    fn default() -> Self {
        ServerStatus {
            state: AtomicU8::new(LifecycleState::Initialized as u8),
            mounted: AtomicBool::new(false),
            http_serving: AtomicBool::new(false),
            grpc_serving: AtomicBool::new(false),
        }
    }
}

impl ServerStatus {
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn set_mounted(&self, mounted: bool) {
        self.mounted.store(mounted, Ordering::Release);
    }

    pub(crate) fn serving_flag(&self, listener: Listener) -> &AtomicBool {
        match listener {
            Listener::Http => &self.http_serving,
            Listener::Grpc => &self.grpc_serving,
        }
    }

    pub fn is_serving(&self, listener: Listener) -> bool {
        self.serving_flag(listener).load(Ordering::Acquire)
    }

    /// Running, fully mounted, and both serving loops alive.
    pub fn is_ready(&self) -> bool {
        self.state() == LifecycleState::Running
            && self.mounted.load(Ordering::Acquire)
            && self.is_serving(Listener::Http)
            && self.is_serving(Listener::Grpc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Listener {
    Http,
    Grpc,
}

impl Listener {
    pub fn as_str(&self) -> &'static str {
        match self {
            Listener::Http => "http",
            Listener::Grpc => "grpc",
        }
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        use LifecycleState::*;
        assert!(Initialized.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
        assert!(Initialized.can_transition_to(Closed));
    }

    #[test]
    fn test_states_are_not_reentrant() {
        use LifecycleState::*;
        assert!(!Running.can_transition_to(Starting));
        assert!(!Closed.can_transition_to(Initialized));
        assert!(!Closed.can_transition_to(Closing));
        assert!(!Closing.can_transition_to(Running));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn test_ready_requires_all_flags() {
        let status = ServerStatus::default();
        assert!(!status.is_ready());

        status.set_state(LifecycleState::Running);
        status.set_mounted(true);
        status
            .serving_flag(Listener::Http)
            .store(true, Ordering::Release);
        assert!(!status.is_ready(), "grpc loop not serving yet");

        status
            .serving_flag(Listener::Grpc)
            .store(true, Ordering::Release);
        assert!(status.is_ready());

        status.set_state(LifecycleState::Closing);
        assert!(!status.is_ready());
    }
}
