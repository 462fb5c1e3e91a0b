//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（Redis のような store、RabbitMQ のような broker）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - store が source of truth（task / schedule の状態はすべて store）
//! - broker は状態遷移の通知（メッセージが失われても store から再開できる）
//! - 本番用アダプタ（Redis, AMQP）は別 crate で実装する

pub mod broker;
pub mod clock;
pub mod id_generator;
pub mod resilient;
pub mod store;

pub use self::broker::{Delivery, MessageBroker, Subscription};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::resilient::{ResilientBroker, ResilientStore};
pub use self::store::KeyValueStore;

use std::sync::Arc;

/// Ports はエンジンが使うインフラ一式
///
/// 同じ store / broker を渡した複数の App は、別々のプロセスとして振る舞います。
#[derive(Clone)]
pub struct Ports {
    pub store: Arc<dyn KeyValueStore>,
    pub broker: Arc<dyn MessageBroker>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
}
