//! Wire-format compatibility levels.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A `(major, minor, sub)` wire-format version, ordered lexicographically.
///
/// Two endpoints negotiate the effective version as the pairwise minimum of
/// what each side speaks; format changes are gated on milestones below.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WireVersion {
    pub major: u8,
    pub minor: u8,
    pub sub: u8,
}

impl WireVersion {
    /// Introduced the confirmed flag on accepts, the replica value field and
    /// membership-change values.
    pub const CONFIRMED_ACCEPTS: WireVersion = WireVersion::new(0, 1, 0);

    /// Introduced the per-frame control byte for out-of-band messages.
    pub const CONTROL_BYTES: WireVersion = WireVersion::new(0, 3, 0);

    /// The newest format this crate speaks.
    pub const CURRENT: WireVersion = WireVersion::CONTROL_BYTES;

    #[must_use]
    pub const fn new(major: u8, minor: u8, sub: u8) -> Self {
        Self { major, minor, sub }
    }
}

impl Default for WireVersion {
    fn default() -> Self {
        WireVersion::CURRENT
    }
}

impl fmt::Display for WireVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.sub)
    }
}
