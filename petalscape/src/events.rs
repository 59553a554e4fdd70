//! Event types for PetalScape

use crate::handle::Handle;
use crate::playback::CompletionReason;

#[derive(Debug, Clone, PartialEq)]
pub enum PetalScapeEvent {
    EngineStarted,
    EnginePaused,
    EngineResumed,
    EngineStopped,
    /// The instance's first tick ran and its units were started
    InstanceStarted {
        instance: Handle,
        source: Handle,
    },
    /// The completion callback for the instance was queued
    InstanceCompleted {
        instance: Handle,
        source: Handle,
        reason: CompletionReason,
    },
    /// Graph resolution failed at play time; the instance will report `Failure`
    ResolutionFailed {
        instance: Handle,
        source: Handle,
        reason: String,
    },
    /// A switch node matched no entry and its fallback produced nothing
    SwitchUnmatched {
        instance: Handle,
        node: Handle,
        label: String,
    },
    /// A looping sampler unit wrapped around
    UnitLooped {
        instance: Handle,
        unit: Handle,
        loop_count: u32,
    },
    /// A pull-stream unit appeared after re-evaluation but no reader was left for it
    StreamUnavailable {
        instance: Handle,
        stream: String,
    },
    /// `update()` found the engine busy and skipped the tick
    TickSkipped,
    RenderSinkError {
        error: String,
    },
}

impl PetalScapeEvent {
    pub fn instance(&self) -> Option<Handle> {
        match self {
            Self::InstanceStarted { instance, .. }
            | Self::InstanceCompleted { instance, .. }
            | Self::ResolutionFailed { instance, .. }
            | Self::SwitchUnmatched { instance, .. }
            | Self::UnitLooped { instance, .. }
            | Self::StreamUnavailable { instance, .. } => Some(*instance),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::ResolutionFailed { .. }
                | Self::StreamUnavailable { .. }
                | Self::RenderSinkError { .. }
        )
    }

    pub fn is_lifecycle_event(&self) -> bool {
        matches!(
            self,
            Self::EngineStarted | Self::EnginePaused | Self::EngineResumed | Self::EngineStopped
        )
    }
}
