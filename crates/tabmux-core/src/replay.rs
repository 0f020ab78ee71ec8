//! Replay planning for (re)attaching clients.
//!
//! A client that reattaches tells us the last sequence it acknowledged. The
//! replay is exactly the bytes after that point, so output the client has
//! already rendered (including a prompt without a trailing newline) is never
//! sent twice. Nothing here looks at the content of the bytes.

use crate::scrollback::ScrollbackSnapshot;

/// Token shown in place of history that was evicted before the client
/// could see it.
pub const TRUNCATION_NOTICE: &str = "\r\n\x1b[2m[scrollback truncated]\x1b[0m\r\n";

/// What a (re)attaching client must receive before live output resumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayPlan {
    /// Sequence of the first byte in `bytes`.
    pub start: u64,
    /// Buffer head at planning time; live output continues from here.
    pub head: u64,
    pub bytes: Vec<u8>,
    /// Part of the client's requested history had been evicted.
    pub truncated: bool,
}

impl ReplayPlan {
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The synthetic notice to render before `bytes`, if history was lost.
    pub fn notice(&self) -> Option<&'static str> {
        self.truncated.then_some(TRUNCATION_NOTICE)
    }

    /// Whether the client must discard its screen before applying the replay.
    ///
    /// True when the client acknowledged a position this PTY never reached.
    /// A truncated replay is not a resync: the client keeps its screen and
    /// renders the notice before the retained bytes.
    pub fn is_resync(&self, last_acked: Option<u64>) -> bool {
        match last_acked {
            None => false,
            Some(acked) => !self.truncated && acked != self.start,
        }
    }
}

/// Compute the replay for a client whose last acknowledged sequence is
/// `last_acked` (`None` for a client that never saw this PTY's output).
///
/// Works on a snapshot so the copy can happen outside the writer's lock.
pub fn compute_replay(history: &ScrollbackSnapshot, last_acked: Option<u64>) -> ReplayPlan {
    let head = history.head();

    let from = match last_acked {
        None => history.tail(),
        // A sequence this PTY never produced: start over from what we have.
        Some(acked) if acked > head => history.tail(),
        Some(acked) => acked,
    };

    let read = history.read_range(from);
    ReplayPlan {
        start: read.start,
        head,
        bytes: read.bytes,
        truncated: read.truncated,
    }
}
