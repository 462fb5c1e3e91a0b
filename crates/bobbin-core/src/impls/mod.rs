//! Impls - port の実装
//!
//! 開発・テスト用の in-memory 実装です。
//! 本番用（Redis, AMQP など）は別 crate で実装することを想定しています。

pub mod inmem_broker;
pub mod inmem_store;

pub use self::inmem_broker::InMemoryBroker;
pub use self::inmem_store::InMemoryStore;
