//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（Clock の時刻を timestamp 部に使う）

use std::sync::atomic::{AtomicU64, Ordering};

use ulid::Ulid;

use crate::domain::ids::{AgentId, MountId, RequestId};
use crate::ports::Clock;

/// IdGenerator は分散システムで使える ID を生成
pub trait IdGenerator: Send + Sync {
    fn generate_request_id(&self) -> RequestId;

    fn generate_agent_id(&self) -> AgentId;

    /// Mount ids are monotonic: each call returns a larger id.
    fn generate_mount_id(&self) -> MountId;
}

/// ULID ids timestamped by a [`Clock`], plus a mount counter.
pub struct UlidGenerator<C> {
    clock: C,
    next_mount_id: AtomicU64,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            next_mount_id: AtomicU64::new(1),
        }
    }

    fn ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_request_id(&self) -> RequestId {
        RequestId::from(self.ulid())
    }

    fn generate_agent_id(&self) -> AgentId {
        AgentId::from(self.ulid())
    }

    fn generate_mount_id(&self) -> MountId {
        MountId::new(self.next_mount_id.fetch_add(1, Ordering::Relaxed))
    }
}
