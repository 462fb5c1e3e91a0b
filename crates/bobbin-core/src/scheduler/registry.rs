//! OperationRegistry - operation 名 → Operation
//!
//! プロセス全体で共有しますが、グローバル変数ではなく App が所有して渡します。
//! 実行中にも登録 / 解除できるように `RwLock` で保護します。

use super::operation::Operation;
use super::step::Step;
use crate::domain::RegistrationError;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub struct OperationRegistry<A>
where
    A: Send + Sync + 'static,
{
    operations: RwLock<HashMap<String, Arc<Operation<A>>>>,
}

impl<A> Default for OperationRegistry<A>
where
    A: Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            operations: RwLock::new(HashMap::new()),
        }
    }
}

impl<A> OperationRegistry<A>
where
    A: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores `operation` under `name`.
    pub fn register(&self, name: impl Into<String>, operation: Operation<A>) -> Result<(), RegistrationError> {
        let name = name.into();
        operation.validate(&name)?;
        let mut operations = self.write();
        if operations.contains_key(&name) {
            return Err(RegistrationError::DuplicateOperation(name));
        }
        operations.insert(name, Arc::new(operation));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Operation<A>>> {
        self.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// The step `step_name` of group `group_index`.
    pub fn get_step(&self, name: &str, group_index: usize, step_name: &str) -> Option<Arc<dyn Step<A>>> {
        let operation = self.get(name)?;
        operation.group(group_index)?.find(step_name).cloned()
    }

    /// Removes `name`. Checking for schedules still using it is the caller's job.
    pub fn unregister(&self, name: &str) -> Option<Arc<Operation<A>>> {
        self.write().remove(name)
    }

    /// Puts back an operation taken out by [`OperationRegistry::unregister`].
    ///
    /// Already validated, so no checks run. Returns `false` if the name was taken meanwhile.
    pub fn reinstate(&self, name: &str, operation: Arc<Operation<A>>) -> bool {
        let mut operations = self.write();
        if operations.contains_key(name) {
            return false;
        }
        operations.insert(name.to_string(), operation);
        true
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Operation<A>>>> {
        self.operations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Operation<A>>>> {
        self.operations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
