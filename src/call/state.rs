//! Call status transitions.
//!
//! Every status change on a [`CallSession`] goes through [`apply_transition`]
//! so the legal edges live in exactly one place. An illegal edge is an error,
//! not a silent overwrite; callers decide whether that tears the call down.

use crate::error::{Error, Result};
use crate::models::{CallSession, CallStatus};
use chrono::Utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    /// Media is flowing; the call becomes `Active`.
    Connected,
    /// Either side hung up.
    Ended,
    /// The callee declined before any media flowed.
    Rejected,
    /// Negotiation or transport failure.
    Failed,
}

/// Advance `session` along `transition`, stamping the timestamps the new
/// status implies.
pub fn apply_transition(session: &mut CallSession, transition: CallTransition) -> Result<()> {
    let from = session.status;
    let to = match (from, transition) {
        (CallStatus::Calling | CallStatus::Ringing, CallTransition::Connected) => {
            session.connected_at = Some(Utc::now());
            CallStatus::Active
        }
        (CallStatus::Calling | CallStatus::Ringing, CallTransition::Rejected) => {
            session.ended_at = Some(Utc::now());
            CallStatus::Rejected
        }
        (_, CallTransition::Ended) if !from.is_terminal() => {
            let ended = Utc::now();
            session.ended_at = Some(ended);
            if let Some(connected) = session.connected_at {
                session.duration_secs = Some((ended - connected).num_seconds().max(0));
            }
            CallStatus::Ended
        }
        (_, CallTransition::Failed) if !from.is_terminal() => {
            session.ended_at = Some(Utc::now());
            CallStatus::Failed
        }
        _ => {
            return Err(Error::InvalidCallState(format!(
                "cannot apply {transition:?} while {from:?}"
            )))
        }
    };
    session.status = to;
    Ok(())
}
