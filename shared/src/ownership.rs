//! Ownership stamps and the deterministic tie-break every participant uses
//! to settle concurrent claims without a coordinator.

use crate::ids::ParticipantId;
use serde::{Deserialize, Serialize};

/// Who owns an entity and the (wrapping, server-clock) millisecond at which
/// that ownership was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnershipStamp {
    pub owner: ParticipantId,
    pub timestamp: u32,
}

impl OwnershipStamp {
    pub fn new(owner: ParticipantId, timestamp: u32) -> Self {
        Self { owner, timestamp }
    }
}

/// Returns true when `a` takes precedence over `b`.
///
/// 1. If the timestamps are more than `i32::MAX` apart the clock is presumed
///    to have wrapped and the numerically smaller timestamp wins.
/// 2. Otherwise the strictly greater (more recent) timestamp wins.
/// 3. Equal timestamps fall back to the lower participant id.
///
/// Fully identical stamps never take precedence over each other.
///
/// Wraparound is judged on the absolute distance rather than on the
/// one-sided `b.wrapping_sub(a) > i32::MAX` test. The one-sided test lets
/// both stamps win: with `a = 5` and `b = u32::MAX - 5`, `a` wraps past
/// `b` while `b - a` measured the other way is only 11.
pub fn can_take_ownership(a: &OwnershipStamp, b: &OwnershipStamp) -> bool {
    let delta = b.timestamp.wrapping_sub(a.timestamp);
    if delta == 0 {
        return a.owner < b.owner;
    }

    if a.timestamp.abs_diff(b.timestamp) > i32::MAX as u32 {
        a.timestamp < b.timestamp
    } else {
        a.timestamp > b.timestamp
    }
}
