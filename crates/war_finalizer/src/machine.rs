//! Pure transition logic of the finalization protocol. No I/O happens
//! here; the driver in `lib.rs` performs the probes and waits each phase
//! asks for.

use std::fmt;
use std::time::Duration;

use core_types::{EngagedWar, TargetId, WarSnapshot};

#[derive(Debug, Clone)]
pub enum ProbeResponse {
    Snapshot {
        snapshot: WarSnapshot,
        payload: serde_json::Value,
        retry_after: Option<Duration>,
    },
    NoAccess,
    Maintenance,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub max_attempts: u32,
    pub maintenance_backoff: Duration,
    pub max_maintenance_backoffs: u32,
    pub default_retry: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            maintenance_backoff: Duration::from_secs(15 * 60),
            max_maintenance_backoffs: 96,
            default_retry: Duration::from_secs(600),
        }
    }
}

/// Which tag is being probed and what has been spent so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub tag: TargetId,
    pub other: TargetId,
    pub switched: bool,
    pub attempts: u32,
    pub backoffs: u32,
}

impl Cursor {
    pub fn new(tag: impl Into<TargetId>, other: impl Into<TargetId>) -> Self {
        Self {
            tag: tag.into(),
            other: other.into(),
            switched: false,
            attempts: 0,
            backoffs: 0,
        }
    }

    fn switched(self) -> Self {
        Self {
            tag: self.other,
            other: self.tag,
            switched: true,
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Finished {
    pub war: EngagedWar,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    NoAccess,
    PrepMismatch,
    Exhausted { attempts: u32 },
    Maintenance { backoffs: u32 },
    Error(String),
    Missed { lateness: Duration },
    Store(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAccess => f.write_str("no access to either clan"),
            Self::PrepMismatch => f.write_str("neither clan shows the tracked war"),
            Self::Exhausted { attempts } => write!(f, "war not ended after {attempts} attempts"),
            Self::Maintenance { backoffs } => {
                write!(f, "api in maintenance for {backoffs} consecutive backoffs")
            }
            Self::Error(err) => write!(f, "probe error: {err}"),
            Self::Missed { lateness } => write!(f, "job fired {}s late", lateness.as_secs()),
            Self::Store(err) => write!(f, "store failed: {err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    /// Probe `cursor.tag` after waiting `delay`.
    Probing { cursor: Cursor, delay: Duration },
    SwitchTag(Cursor),
    /// Upstream maintenance; wait the backoff, then probe the same tag.
    Backoff(Cursor),
    Done(Box<Finished>),
    Failed(FailureReason),
}

impl Phase {
    pub fn start(tag: impl Into<TargetId>, other: impl Into<TargetId>) -> Self {
        Self::Probing {
            cursor: Cursor::new(tag, other),
            delay: Duration::ZERO,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Failed(_))
    }
}

/// Next phase after probing `cursor.tag` and receiving `response`.
pub fn on_probe(
    cursor: Cursor,
    response: ProbeResponse,
    expected_prep: i64,
    policy: &Policy,
) -> Phase {
    match response {
        ProbeResponse::Maintenance => {
            let backoffs = cursor.backoffs + 1;
            if backoffs > policy.max_maintenance_backoffs {
                Phase::Failed(FailureReason::Maintenance {
                    backoffs: cursor.backoffs,
                })
            } else {
                Phase::Backoff(Cursor { backoffs, ..cursor })
            }
        }
        ProbeResponse::Error(err) => Phase::Failed(FailureReason::Error(err)),
        ProbeResponse::NoAccess => switch_or(cursor, FailureReason::NoAccess),
        ProbeResponse::Snapshot {
            snapshot,
            payload,
            retry_after,
        } => {
            let cursor = Cursor {
                backoffs: 0,
                ..cursor
            };
            let war = match snapshot {
                WarSnapshot::Engaged(war) => war,
                WarSnapshot::NotInWar => return switch_or(cursor, FailureReason::PrepMismatch),
            };
            if war.is_ended() {
                return Phase::Done(Box::new(Finished { war, payload }));
            }
            if war.preparation_ts() != expected_prep {
                return switch_or(cursor, FailureReason::PrepMismatch);
            }
            let attempts = cursor.attempts + 1;
            if attempts >= policy.max_attempts {
                return Phase::Failed(FailureReason::Exhausted { attempts });
            }
            Phase::Probing {
                cursor: Cursor { attempts, ..cursor },
                delay: retry_after.unwrap_or(policy.default_retry),
            }
        }
    }
}

fn switch_or(cursor: Cursor, reason: FailureReason) -> Phase {
    if cursor.switched {
        Phase::Failed(reason)
    } else {
        Phase::SwitchTag(cursor)
    }
}

/// Phases that need no probe response to advance.
pub fn advance(phase: Phase) -> Phase {
    match phase {
        Phase::SwitchTag(cursor) => Phase::Probing {
            cursor: cursor.switched(),
            delay: Duration::ZERO,
        },
        Phase::Backoff(cursor) => Phase::Probing {
            cursor,
            delay: Duration::ZERO,
        },
        other => other,
    }
}
