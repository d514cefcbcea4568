//! Mount policies: per-tenant thresholds and concurrency quota.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::mount::MountKind;

/// Per-tenant/class scheduling configuration. Owned by the catalogue and
/// copied by value into every queued request.
///
/// A queue becomes worth a mount once any threshold is exceeded: enough
/// files, enough bytes, or an oldest request older than `max_request_age`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPolicy {
    pub name: String,
    pub archive_priority: u64,
    pub retrieve_priority: u64,
    pub max_files_queued: u64,
    pub max_bytes_queued: u64,
    #[serde(with = "duration_secs")]
    pub max_request_age: Duration,
    /// Quota: the maximum number of concurrent mounts for this class.
    pub max_drives_allowed: u64,
}

impl MountPolicy {
    pub fn priority(&self, kind: MountKind) -> u64 {
        match kind {
            MountKind::Archive => self.archive_priority,
            MountKind::Retrieve => self.retrieve_priority,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
