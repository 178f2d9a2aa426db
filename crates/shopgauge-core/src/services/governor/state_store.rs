//! Shared application state for optimistic updates
//!
//! Optimistic mutations are expressed as JSON merge patches (RFC 7396). The
//! store applies a patch and hands back its inverse in the same critical
//! section, so a rollback restores exactly the keys the patch touched and
//! never clobbers changes made by other in-flight mutations.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while applying a patch
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    /// Patch is structurally unusable
    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    /// Store refused the patch
    #[error("Patch rejected: {0}")]
    Rejected(String),

    /// Store lock was poisoned by a panicking writer
    #[error("State store poisoned")]
    Poisoned,
}

// ============================================================================
// StatePatch
// ============================================================================

/// A JSON merge patch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatePatch(Value);

impl StatePatch {
    pub fn new(patch: Value) -> Self {
        Self(patch)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for StatePatch {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

// ============================================================================
// StateStore Trait
// ============================================================================

/// State that optimistic mutations write into
pub trait StateStore: Send + Sync {
    /// Current state
    fn snapshot(&self) -> Value;

    /// Apply `patch` and return the patch that undoes it
    ///
    /// Merge patches use `null` for deletion, so a key whose prior value was
    /// an explicit JSON `null` cannot be restored: undoing a change to it
    /// removes the key instead.
    fn apply(&self, patch: &StatePatch) -> Result<StatePatch, StateError>;
}

/// In-memory JSON document
#[derive(Debug, Default)]
pub struct JsonStateStore {
    state: RwLock<Value>,
}

impl JsonStateStore {
    pub fn new(initial: Value) -> Self {
        Self {
            state: RwLock::new(initial),
        }
    }
}

impl StateStore for JsonStateStore {
    fn snapshot(&self) -> Value {
        match self.state.read() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn apply(&self, patch: &StatePatch) -> Result<StatePatch, StateError> {
        let mut state = self.state.write().map_err(|_| StateError::Poisoned)?;
        let inverse = inverse_of(&state, patch.as_value());
        merge_patch(&mut state, patch.as_value());
        Ok(StatePatch(inverse))
    }
}

/// Apply an RFC 7396 merge patch to `target`
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(target_map) = target else {
        return;
    };

    for (key, value) in patch_map {
        if value.is_null() {
            target_map.remove(key);
        } else {
            let entry = target_map.entry(key.clone()).or_insert(Value::Null);
            merge_patch(entry, value);
        }
    }
}

/// Merge patch that undoes `patch` when applied after it
///
/// Only keys present in `patch` appear in the result. A key the patch
/// introduces maps to `null`; a key it changes or removes maps to its prior
/// value.
fn inverse_of(target: &Value, patch: &Value) -> Value {
    let (Value::Object(patch_map), Value::Object(target_map)) = (patch, target) else {
        return target.clone();
    };

    let mut inverse = Map::new();
    for (key, value) in patch_map {
        match target_map.get(key) {
            Some(previous) if value.is_object() && previous.is_object() => {
                inverse.insert(key.clone(), inverse_of(previous, value));
            }
            Some(previous) => {
                inverse.insert(key.clone(), previous.clone());
            }
            None if !value.is_null() => {
                inverse.insert(key.clone(), Value::Null);
            }
            None => {}
        }
    }
    Value::Object(inverse)
}

// ============================================================================
// Tests
// ============================================================================
