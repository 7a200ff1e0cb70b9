//! Per-(notification, channel) delivery state machine.
//!
//! ```text
//! queued -> sending -> sent
//!                   -> failed_transient -> (attempt n+1 queued) | failed_terminal
//!                   -> failed_terminal
//! queued -> cancelled
//! ```
//!
//! A retry is a new attempt row, so `failed_transient` itself only ever moves
//! to `failed_terminal`. Nothing leaves `sent`, `failed_terminal` or `cancelled`.

use thiserror::Error;

use courier_common::error::DispatchError;
use courier_common::types::ChannelState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal channel transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: ChannelState,
    pub to: ChannelState,
}

impl From<IllegalTransition> for DispatchError {
    fn from(err: IllegalTransition) -> Self {
        DispatchError::Internal(err.to_string())
    }
}

pub fn can_transition(from: ChannelState, to: ChannelState) -> bool {
    use ChannelState::*;

    matches!(
        (from, to),
        (Queued, Sending)
            | (Queued, Cancelled)
            | (Sending, Sent)
            | (Sending, FailedTransient)
            | (Sending, FailedTerminal)
            | (FailedTransient, FailedTerminal)
    )
}

pub fn check(from: ChannelState, to: ChannelState) -> Result<(), IllegalTransition> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(IllegalTransition { from, to })
    }
}
