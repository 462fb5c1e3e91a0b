//! Context maps passed between callers, deferred tasks and steps.
//!
//! すべての context は JSON object（`serde_json::Map`）です。
//! キー集合の検証は Operation 登録時（[`crate::scheduler::Operation::validate`]）と
//! step 実行時の両方で行います。

use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// String-keyed JSON object; key order is irrelevant.
pub type ContextMap = Map<String, Value>;

/// Process-wide context injected when the deferred manager is built.
pub type GlobalsContext = ContextMap;

/// Per-task arguments supplied at `start`.
pub type StartContext = ContextMap;

/// `GlobalsContext` merged with `StartContext`; read-only to a running task.
pub type DeferredContext = ContextMap;

/// Accumulated context of one schedule.
pub type OperationContext = ContextMap;

/// The subset of [`OperationContext`] a step hook declared it requires.
pub type RequiredOperationContext = ContextMap;

/// What a step hook hands back to be merged into the [`OperationContext`].
pub type ProvidedOperationContext = ContextMap;

pub type OperationName = String;
pub type StepName = String;

/// Injected into every step's required context.
pub const SCHEDULE_ID_KEY: &str = "schedule_id";
/// Injected into every step's required context.
pub const OPERATION_NAME_KEY: &str = "operation_name";

/// Keys no step may provide.
pub const RESERVED_KEYS: [&str; 2] = [SCHEDULE_ID_KEY, OPERATION_NAME_KEY];

/// `overlay` wins on conflicting keys.
pub fn merge(base: &ContextMap, overlay: &ContextMap) -> ContextMap {
    let mut merged = base.clone();
    for (key, value) in overlay {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Keys in `required` that `context` lacks, in sorted order.
pub fn missing_keys<'a, I>(context: &ContextMap, required: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let missing: BTreeSet<String> = required
        .into_iter()
        .filter(|key| !context.contains_key(*key))
        .map(str::to_string)
        .collect();
    missing.into_iter().collect()
}

/// Copies only `keys` out of `context`. Absent keys are skipped.
pub fn select<'a, I>(context: &ContextMap, keys: I) -> ContextMap
where
    I: IntoIterator<Item = &'a str>,
{
    keys.into_iter()
        .filter_map(|key| context.get(key).map(|value| (key.to_string(), value.clone())))
        .collect()
}

pub fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}
