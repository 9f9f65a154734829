//! Per-state auxiliary records
//!
//! Plugins attach their own records to every execution state. When the engine duplicates a
//! state for forking it clones the store, which clones each record through
//! [`PluginState::clone_state`]; the two copies then diverge independently.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

/// A record attached to an execution state
pub trait PluginState: Send + Sync + 'static {
    /// Duplicate this record for a forked state
    fn clone_state(&self) -> Box<dyn PluginState>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T> PluginState for T
where
    T: Clone + Send + Sync + 'static,
{
    fn clone_state(&self) -> Box<dyn PluginState> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Type-keyed collection of per-state records, one per record type
#[derive(Default)]
pub struct PluginStateStore {
    records: HashMap<TypeId, Box<dyn PluginState>>,
}

impl PluginStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record of type `T`, if one was ever created for this state
    pub fn get<T: PluginState>(&self) -> Option<&T> {
        self.records
            .get(&TypeId::of::<T>())
            .and_then(|record| (**record).as_any().downcast_ref::<T>())
    }

    /// Record of type `T`, if one was ever created for this state
    pub fn get_mut<T: PluginState>(&mut self) -> Option<&mut T> {
        self.records
            .get_mut(&TypeId::of::<T>())
            .and_then(|record| (**record).as_any_mut().downcast_mut::<T>())
    }

    /// Run `f` on the record of type `T`, creating it with its default value on first access
    ///
    /// A record that does not downcast to `T` is replaced by a fresh default.
    pub fn with_default<T, R, F>(&mut self, f: F) -> R
    where
        T: PluginState + Default,
        F: FnOnce(&mut T) -> R,
    {
        let id = TypeId::of::<T>();
        let mut record: Box<T> = match self.records.remove(&id) {
            Some(record) => record.into_any().downcast::<T>().unwrap_or_else(|_| {
                log::warn!("discarding plugin state of a foreign type");
                Box::default()
            }),
            None => Box::default(),
        };

        let output = f(&mut *record);
        self.records.insert(id, record);
        output
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Clone for PluginStateStore {
    fn clone(&self) -> Self {
        Self {
            records: self
                .records
                .iter()
                .map(|(id, record)| (*id, (**record).clone_state()))
                .collect(),
        }
    }
}

impl fmt::Debug for PluginStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginStateStore")
            .field("records", &self.records.len())
            .finish()
    }
}
