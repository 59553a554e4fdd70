//! Seam between the engine and the renderer that actually produces audio.
//!
//! Every `update()` tick turns changes in the set of live render units into
//! [`RenderCommand`]s and hands them, in order, to the installed
//! [`RenderSink`]. Decoding, mixing and output are the sink's business.

use crate::audio_asset::AudioBuffer;
use crate::error::{PetalScapeError, Result};
use crate::graph::CalibrationMode;
use crate::handle::Handle;
use crate::stream::StreamReader;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;

/// Audio a unit plays.
#[derive(Debug)]
pub enum RenderInput {
    /// Shared PCM buffer, unaffected by later unregistration of the asset
    Sample { buffer: Arc<AudioBuffer>, looping: bool },
    /// Consumer half of a streaming ring buffer
    Stream(StreamReader),
}

#[derive(Debug)]
pub enum RenderCommand {
    Start {
        unit: Handle,
        instance: Handle,
        source: Handle,
        mixer: Handle,
        input: RenderInput,
        calibration: CalibrationMode,
        level: f64,
        gain: f32,
        rate: f64,
    },
    Update {
        unit: Handle,
        gain: f32,
        rate: f64,
    },
    Stop {
        unit: Handle,
    },
}

impl RenderCommand {
    pub fn unit(&self) -> Handle {
        match self {
            Self::Start { unit, .. } | Self::Update { unit, .. } | Self::Stop { unit } => *unit,
        }
    }
}

/// Receiver of render commands. Called from inside `update()`, so
/// implementations must not block.
pub trait RenderSink: Send {
    fn submit(&mut self, command: RenderCommand) -> Result<()>;
}

/// Sink forwarding commands over an unbounded channel to a render thread.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: Sender<RenderCommand>,
}

impl ChannelSink {
    pub fn unbounded() -> (Self, Receiver<RenderCommand>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Self { sender }, receiver)
    }
}

impl RenderSink for ChannelSink {
    fn submit(&mut self, command: RenderCommand) -> Result<()> {
        self.sender
            .send(command)
            .map_err(|_| PetalScapeError::InvalidState("render channel disconnected".into()))
    }
}

/// Sink that drops every command. Installed until a real one is set.
#[derive(Debug, Default)]
pub struct NullSink;

impl RenderSink for NullSink {
    fn submit(&mut self, _command: RenderCommand) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_forwards_in_order() {
        let (mut sink, receiver) = ChannelSink::unbounded();
        sink.submit(RenderCommand::Update {
            unit: Handle::from_raw(3),
            gain: 0.5,
            rate: 1.0,
        })
        .unwrap();
        sink.submit(RenderCommand::Stop {
            unit: Handle::from_raw(3),
        })
        .unwrap();

        let commands: Vec<RenderCommand> = receiver.try_iter().collect();
        assert_eq!(commands.len(), 2);
        assert!(matches!(commands[0], RenderCommand::Update { .. }));
        assert!(matches!(commands[1], RenderCommand::Stop { .. }));
        assert!(commands.iter().all(|c| c.unit() == Handle::from_raw(3)));
    }

    #[test]
    fn test_disconnected_channel_reports_error() {
        let (mut sink, receiver) = ChannelSink::unbounded();
        drop(receiver);
        assert!(sink
            .submit(RenderCommand::Stop {
                unit: Handle::from_raw(1)
            })
            .is_err());
    }
}
