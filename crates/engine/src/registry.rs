//! Stack-name-keyed store of in-flight validations.
//!
//! Lets other subsystems ask "what is currently happening to stack X"
//! without knowing the originating workflow id. One entry per stack name:
//! adding a second validation for the same stack replaces the first.

use dashmap::DashMap;
use stackward_core::Validation;

#[derive(Debug, Default)]
pub struct ValidationRegistry {
    entries: DashMap<String, Validation>,
}

impl ValidationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `validation`, replacing any entry for the same stack name.
    pub fn add(&self, validation: Validation) {
        if let Some(previous) = self
            .entries
            .insert(validation.stack_name.clone(), validation)
        {
            tracing::debug!(
                stack_name = %previous.stack_name,
                change_set_name = %previous.change_set_name,
                "replaced in-flight validation"
            );
        }
    }

    pub fn get(&self, stack_name: &str) -> Option<Validation> {
        self.entries.get(stack_name).map(|entry| entry.value().clone())
    }

    /// Apply `f` to the entry for `stack_name` if it still belongs to
    /// `change_set_name`. Returns whether an entry was updated.
    pub fn update<F>(&self, stack_name: &str, change_set_name: &str, f: F) -> bool
    where
        F: FnOnce(&mut Validation),
    {
        match self.entries.get_mut(stack_name) {
            Some(mut entry) if entry.change_set_name == change_set_name => {
                f(entry.value_mut());
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, stack_name: &str) -> Option<Validation> {
        self.entries.remove(stack_name).map(|(_, validation)| validation)
    }

    /// Remove the entry for `stack_name` only if it belongs to `change_set_name`.
    pub fn remove_owned(&self, stack_name: &str, change_set_name: &str) -> Option<Validation> {
        self.entries
            .remove_if(stack_name, |_, validation| {
                validation.change_set_name == change_set_name
            })
            .map(|(_, validation)| validation)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
