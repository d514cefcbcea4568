//! App - アプリケーション層
//!
//! ports を組み合わせてスケジューリングのロジックを実装します。
//!
//! # 主要コンポーネント
//! - **Scheduler**: キュー投入・キャンセル・マウント決定の入口
//! - **selection**: ドライブごとの候補フィルタと優先順位付け（純粋関数）
//! - **DriveSessionGroup**: ドライブごとのマウント実行ループ
//! - **status**: 運用者向けの集計ビュー

pub mod drive_session;
pub mod scheduler;
pub mod selection;
pub mod status;

pub use self::drive_session::{DriveSessionGroup, TransferError, TransferHandler};
pub use self::scheduler::Scheduler;
pub use self::selection::{DriveContext, Selection, select_candidates};
pub use self::status::{QueueSummary, SchedulerStatus, summarize};
