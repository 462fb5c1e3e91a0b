//! Deferred - 名前付きでリトライ可能な非同期タスクのエンジン
//!
//! - **handler**: `DeferredHandler` trait（実装側）
//! - **registry**: handler 名 → 実装
//! - **tracker**: store 上のタスクレコード（CAS で状態遷移）
//! - **worker**: プロセスごとの実行枠、timeout / panic / cancel の扱い
//! - **events**: タスクごとの補助イベントストリーム
//! - **manager**: 公開 API と状態ごとの consumer ループ

pub mod events;
pub mod handler;
pub mod manager;
pub mod registry;
pub mod stats;
pub mod status;
pub mod tracker;
pub mod worker;

pub use self::handler::DeferredHandler;
pub use self::manager::{DeferredManager, DeferredOptions};
pub use self::registry::HandlerRegistry;
pub use self::stats::DeferredStatsSnapshot;
pub use self::status::{TaskCounts, TaskStatus};
