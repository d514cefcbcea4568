//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryQueueStore**: 要求キュー・マウント割り当て・スケジューリングロック
//! - **InMemoryDriveRegistry**: ドライブ状態
//! - **InMemoryCatalogue**: ルーティングとテープ情報（テスト・CLI デモ用）

pub mod memory_catalogue;
pub mod memory_drive_registry;
pub mod memory_store;

// 主要な型を再エクスポート
pub use self::memory_catalogue::{CatalogueBuilder, InMemoryCatalogue, StorageClass};
pub use self::memory_drive_registry::InMemoryDriveRegistry;
pub use self::memory_store::InMemoryQueueStore;
