// Job registry: maps job names to live job instances

use crate::errors::SchedulingError;
use crate::jobs::{Job, JobKind, JobName};
use crate::scheduler::Trigger;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Registry entry. One-shot entries are removed when they fire.
#[derive(Clone)]
pub enum RegisteredJob {
    OneShot(Arc<dyn Job>),
    Recurring(Arc<dyn Job>),
}

impl RegisteredJob {
    fn for_trigger(job: Arc<dyn Job>, trigger: &Trigger) -> Self {
        if trigger.is_one_shot() {
            RegisteredJob::OneShot(job)
        } else {
            RegisteredJob::Recurring(job)
        }
    }

    pub fn job(&self) -> &Arc<dyn Job> {
        match self {
            RegisteredJob::OneShot(job) | RegisteredJob::Recurring(job) => job,
        }
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self, RegisteredJob::OneShot(_))
    }
}

/// Snapshot of a registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisteredJobInfo {
    pub name: JobName,
    pub kind: JobKind,
    pub recurring: bool,
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobName, RegisteredJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking job never holds this lock, so poisoning carries no torn state
    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobName, RegisteredJob>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobName, RegisteredJob>> {
        self.jobs.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `job` under its name; the trigger decides the entry variant
    pub fn register(&self, job: Arc<dyn Job>, trigger: &Trigger) -> Result<(), SchedulingError> {
        let mut jobs = self.write();
        let name = job.name().clone();
        if jobs.contains_key(&name) {
            return Err(SchedulingError::DuplicateJob(name.to_string()));
        }
        jobs.insert(name, RegisteredJob::for_trigger(job, trigger));
        Ok(())
    }

    pub fn lookup(&self, name: &JobName) -> Option<Arc<dyn Job>> {
        self.read().get(name).map(|entry| Arc::clone(entry.job()))
    }

    /// Resolve a job for a trigger firing, dropping one-shot entries
    pub fn take_for_firing(&self, name: &JobName) -> Option<Arc<dyn Job>> {
        let mut jobs = self.write();
        match jobs.get(name)? {
            RegisteredJob::Recurring(job) => Some(Arc::clone(job)),
            RegisteredJob::OneShot(_) => jobs.remove(name).map(|entry| Arc::clone(entry.job())),
        }
    }

    pub fn contains(&self, name: &JobName) -> bool {
        self.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Entries sorted by name
    pub fn snapshot(&self) -> Vec<RegisteredJobInfo> {
        let mut infos: Vec<RegisteredJobInfo> = self
            .read()
            .iter()
            .map(|(name, entry)| RegisteredJobInfo {
                name: name.clone(),
                kind: entry.job().kind(),
                recurring: !entry.is_one_shot(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Drop every entry, returning how many were registered
    pub fn clear(&self) -> usize {
        let mut jobs = self.write();
        let count = jobs.len();
        jobs.clear();
        count
    }
}
