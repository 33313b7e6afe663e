//! Job-type registry used by the tagged serializer.
//!
//! Each `TaggedSerializer` owns its own registry, so two queue managers in one
//! process never share registrations.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::job::{Job, JobType};
use crate::error::{QueueError, Result};

/// Rebuilds a job handler from its field snapshot.
pub type JobConstructor = Arc<dyn Fn(serde_json::Value) -> Result<Box<dyn Job>> + Send + Sync>;

/// Maps job type names to constructors.
#[derive(Clone, Default)]
pub struct JobRegistry {
    constructors: HashMap<String, JobConstructor>,
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a serde-backed job type under `T::NAME`.
    pub fn register<T: JobType>(&mut self) -> Result<()> {
        self.register_with(T::NAME, |properties| {
            let job: T = serde_json::from_value(properties)?;
            Ok(Box::new(job) as Box<dyn Job>)
        })
    }

    /// Register a custom constructor.
    pub fn register_with<F>(&mut self, name: impl Into<String>, constructor: F) -> Result<()>
    where
        F: Fn(serde_json::Value) -> Result<Box<dyn Job>> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.constructors.contains_key(&name) {
            return Err(QueueError::already_registered(name));
        }
        self.constructors.insert(name, Arc::new(constructor));
        Ok(())
    }

    /// Build a job of type `name` from its properties.
    pub fn construct(&self, name: &str, properties: serde_json::Value) -> Result<Box<dyn Job>> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| QueueError::unknown_job_type(name))?;
        constructor(properties)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}
