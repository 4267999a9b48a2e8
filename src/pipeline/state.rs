use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineState {
    /// Binding a backend, either at registration or after a restart
    Initializing,
    /// Processing on the most preferred backend that came up
    Running,
    /// Processing on a fallback backend after repeated failures
    Degraded,
    Paused,
    /// Gracefully stopped; terminal
    Stopped,
    /// Restart budget exceeded; terminal
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Stopped | PipelineState::Failed)
    }

    /// Whether frames are being processed.
    pub fn is_processing(&self) -> bool {
        matches!(self, PipelineState::Running | PipelineState::Degraded)
    }

    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;

        if self.is_terminal() || *self == next {
            return false;
        }
        match (self, next) {
            (_, Stopped | Failed | Paused) => true,
            (Initializing, Running | Degraded) => true,
            (Running, Degraded) | (Degraded, Running) => true,
            // restart after a crash
            (Running | Degraded, Initializing) => true,
            // resume into whatever was interrupted
            (Paused, Initializing | Running | Degraded) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Initializing => "initializing",
            PipelineState::Running => "running",
            PipelineState::Degraded => "degraded",
            PipelineState::Paused => "paused",
            PipelineState::Stopped => "stopped",
            PipelineState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::PipelineState::*;

    #[test]
    fn test_terminal_states_are_final() {
        for next in [Initializing, Running, Degraded, Paused, Stopped, Failed] {
            assert!(!Stopped.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
    }

    #[test]
    fn test_lifecycle_edges() {
        assert!(Initializing.can_transition_to(Running));
        assert!(Running.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Failed));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Degraded));
        assert!(Paused.can_transition_to(Stopped));
        assert!(Paused.can_transition_to(Failed));
        assert!(!Initializing.can_transition_to(Initializing));
        assert!(!Running.can_transition_to(Running));
    }
}
