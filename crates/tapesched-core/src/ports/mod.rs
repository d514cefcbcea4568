//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait はスケジューラの外側（要求キューの永続化、ドライブ登録簿、
//! カタログ）へのインターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - QueueStore が要求キューとスケジューリングロックの正本
//! - DriveRegistry がドライブ状態の正本
//! - Catalogue はルーティングとテープ情報の参照のみ

pub mod catalogue;
pub mod clock;
pub mod drive_registry;
pub mod id_generator;
pub mod queue_store;

// 主要な trait を再エクスポート
pub use self::catalogue::{Catalogue, LogicalLibrary, TapeForWriting, TapeInfo};
pub use self::clock::{Clock, FixedClock, ManualClock, SystemClock};
pub use self::drive_registry::DriveRegistry;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::queue_store::{
    CancellationFinalizer, CreationFinalizer, Job, JobReporter, MountDecision, MountFactory,
    PendingCancellation, QueueStore, RequestCancellation, RequestCreation, TapeMount,
};
