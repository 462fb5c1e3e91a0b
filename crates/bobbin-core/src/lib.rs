//! bobbin-core
//!
//! Distributed deferred tasks and a compensating (saga) scheduler on top of a shared
//! key-value store and message broker.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, context, state, errors, events, retry）
//! - **ports**: 抽象化レイヤー（KeyValueStore, MessageBroker, Clock, IdGenerator, Resilient ラッパー）
//! - **impls**: 実装（InMemoryStore / InMemoryBroker、テストと demo 用）
//! - **deferred**: at-least-once の deferred task エンジン
//! - **scheduler**: step group の作成と逆順の revert を行う operation scheduler
//! - **app**: builder, config, プロセスのライフサイクル
//!
//! # 設計原則
//! - 状態はすべて store に置き、プロセスはいつ落ちてもよい
//! - 状態遷移は compare-and-set で 1 プロセスだけが勝つ
//! - ワークフローの定義は登録時に検証する（Fail-fast）

pub mod app;
pub mod deferred;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod scheduler;

pub use app::{App, AppBuilder, BobbinConfig};
pub use domain::{BobbinError, BobbinResult};
