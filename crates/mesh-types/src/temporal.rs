use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Value of [`Timestamps::expires`] meaning the object never expires.
pub const NEVER_EXPIRES: i64 = -1;

/// Last value handed out by [`now_millis`].
static LAST_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Wall-clock milliseconds since the UNIX epoch, never decreasing within
/// this process even if the system clock steps backwards.
pub fn now_millis() -> i64 {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;
    let previous = LAST_MILLIS.fetch_max(wall, Ordering::AcqRel);
    wall.max(previous)
}

/// The four timestamps every MeshObject carries, in milliseconds since the
/// UNIX epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamps {
    pub created: i64,
    pub updated: i64,
    pub read: i64,
    /// [`NEVER_EXPIRES`] if the object never expires.
    pub expires: i64,
}

impl Timestamps {
    /// Timestamps for an object created right now that never expires.
    pub fn now() -> Self {
        Self::at(now_millis())
    }

    /// Timestamps for an object created at `millis` that never expires.
    pub fn at(millis: i64) -> Self {
        Self {
            created: millis,
            updated: millis,
            read: millis,
            expires: NEVER_EXPIRES,
        }
    }

    pub fn never_expires(&self) -> bool {
        self.expires == NEVER_EXPIRES
    }

    /// Returns `true` if the object has expired at time `now`.
    pub fn is_expired_at(&self, now: i64) -> bool {
        !self.never_expires() && self.expires <= now
    }
}

impl Default for Timestamps {
    fn default() -> Self {
        Self::now()
    }
}
