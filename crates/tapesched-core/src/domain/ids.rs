//! Domain identifiers (strongly-typed IDs).
//!
//! Queue entries are addressed by ULID-based ids: they sort by creation time,
//! which is exactly the order the queues are read back in. Mounts use a plain
//! monotonic counter instead, so that an operator can read the mount history
//! of a drive in sequence.
//!
//! `Id<T>` は PhantomData のマーカー型で種類を区別します（実行時コストなし）。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for the kinds of ULID ids.
pub trait IdMarker: Send + Sync + 'static {
    /// Prefix used by `Display` (e.g. "req-").
    fn prefix() -> &'static str;
}

/// Generic ULID id. `T` only exists at compile time.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Marker for archive/retrieve requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Request {}

impl IdMarker for Request {
    fn prefix() -> &'static str {
        "req-"
    }
}

/// Marker for the agents (processes) that own in-flight queue entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Agent {}

impl IdMarker for Agent {
    fn prefix() -> &'static str {
        "agent-"
    }
}

/// Identifier of a queued archive or retrieve request.
pub type RequestId = Id<Request>;

/// Identifier of a process owning entries outside of the regular queues.
pub type AgentId = Id<Agent>;

/// Identifier of a mount session. Allocated from a monotonic counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MountId(u64);

impl MountId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mount-{}", self.0)
    }
}

/// Catalogue-assigned identifier of an archived file.
pub type ArchiveFileId = u64;
