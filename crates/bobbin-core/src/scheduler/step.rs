//! Step - 補償可能な最小単位
//!
//! 各 step は `create` と `revert` の 2 つの hook を持ち、
//! どちらも 1 つの deferred task として実行されます（retry / timeout / cancel を継承）。
//!
//! # 使用例
//! ```ignore
//! struct CreateVolume;
//!
//! #[async_trait]
//! impl Step<Platform> for CreateVolume {
//!     fn create_requires(&self) -> &[&'static str] {
//!         &["node_id"]
//!     }
//!
//!     fn create_provides(&self) -> &[&'static str] {
//!         &["volume_id"]
//!     }
//!
//!     async fn create(&self, app: &Platform, ctx: RequiredOperationContext)
//!         -> Result<Option<ProvidedOperationContext>, BoxError>
//!     {
//!         let volume = app.volumes.create(&ctx["node_id"]).await?;
//!         let mut provided = ProvidedOperationContext::new();
//!         provided.insert("volume_id".into(), json!(volume.id));
//!         Ok(Some(provided))
//!     }
//! }
//! ```
//!
//! # 学習ポイント
//! - 継承の代わりに trait object（`Arc<dyn Step<A>>`）として登録する
//! - `A` はアプリケーションが渡す任意の値。コアは中身を見ない

use crate::domain::{BoxError, ProvidedOperationContext, RequiredOperationContext};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Retry / timeout settings of one hook. Handed to the deferred engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookPolicy {
    pub retries: u32,
    pub timeout: Option<Duration>,
    pub wait_between_attempts: Duration,
}

impl Default for HookPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            timeout: None,
            wait_between_attempts: Duration::from_secs(5),
        }
    }
}

impl HookPolicy {
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_wait_between_attempts(mut self, wait: Duration) -> Self {
        self.wait_between_attempts = wait;
        self
    }
}

/// Step は operation を構成する補償可能な単位
///
/// `create` が返した context のキー集合は `create_provides` と一致しなければなりません
/// （`revert` も同様）。宣言が空なら `None` を返して構いません。
#[async_trait]
pub trait Step<A>: Send + Sync + 'static
where
    A: Send + Sync + 'static,
{
    /// Unique within an operation. Defaults to the type name without its module path.
    fn name(&self) -> String {
        let full = std::any::type_name::<Self>();
        let base = full.split('<').next().unwrap_or(full);
        base.rsplit("::").next().unwrap_or(base).to_string()
    }

    async fn create(
        &self,
        app: &A,
        context: RequiredOperationContext,
    ) -> Result<Option<ProvidedOperationContext>, BoxError>;

    async fn revert(
        &self,
        _app: &A,
        _context: RequiredOperationContext,
    ) -> Result<Option<ProvidedOperationContext>, BoxError> {
        Ok(None)
    }

    fn create_requires(&self) -> &[&'static str] {
        &[]
    }

    fn create_provides(&self) -> &[&'static str] {
        &[]
    }

    fn revert_requires(&self) -> &[&'static str] {
        &[]
    }

    fn revert_provides(&self) -> &[&'static str] {
        &[]
    }

    fn create_policy(&self) -> HookPolicy {
        HookPolicy::default()
    }

    fn revert_policy(&self) -> HookPolicy {
        HookPolicy::default()
    }

    /// A failed create parks the schedule for an operator instead of reverting it.
    fn wait_for_manual_intervention(&self) -> bool {
        false
    }
}

/// Boxes a step for registration.
pub fn step<A, S>(step: S) -> Arc<dyn Step<A>>
where
    A: Send + Sync + 'static,
    S: Step<A>,
{
    Arc::new(step)
}
