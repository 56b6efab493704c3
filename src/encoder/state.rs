//! Encoder state and its wire encoding

use std::fmt;

/// Lifecycle state of the encoder process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EncoderState {
    /// Nothing launched yet
    #[default]
    Null,
    /// Process is up and reachable on the bus
    Spawned,
    Configured,
    Ready,
    Started,
    Paused,
    /// Process is gone; no further transitions are expected
    Terminated,
}

impl EncoderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderState::Null => "NULL",
            EncoderState::Spawned => "SPAWNED",
            EncoderState::Configured => "CONFIGURED",
            EncoderState::Ready => "READY",
            EncoderState::Started => "STARTED",
            EncoderState::Paused => "PAUSED",
            EncoderState::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for EncoderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of decoding a `State` property value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    Known(EncoderState),
    Unknown(i64),
}

/// Integer codes the encoder publishes in its `State` property.
///
/// `Spawned` is local bookkeeping and has no code.
pub struct StateCode;

impl StateCode {
    pub fn decode(code: i64) -> Decoded {
        let state = match code {
            0 => EncoderState::Null,
            1 => EncoderState::Configured,
            2 => EncoderState::Ready,
            3 => EncoderState::Started,
            4 => EncoderState::Paused,
            5 => EncoderState::Terminated,
            other => return Decoded::Unknown(other),
        };
        Decoded::Known(state)
    }
}

/// Current state plus change detection.
///
/// Repeating the current state is not a transition.
#[derive(Debug, Default)]
pub struct StateMachine {
    current: EncoderState,
}

impl StateMachine {
    pub fn current(&self) -> EncoderState {
        self.current
    }

    /// Record `next`, returning the previous state if it actually changed
    pub fn transition(&mut self, next: EncoderState) -> Option<EncoderState> {
        if self.current == next {
            return None;
        }
        let previous = std::mem::replace(&mut self.current, next);
        Some(previous)
    }
}
