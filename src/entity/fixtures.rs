//! Minimal entity used by store and engine unit tests

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{EntityId, EntityMeta, ProcessState, StatefulEntity};
use crate::store::query::PropertyValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Running,
    Done,
    Failed,
}

impl ProcessState for JobState {
    fn code(self) -> i32 {
        match self {
            JobState::Queued => 10,
            JobState::Running => 20,
            JobState::Done => 30,
            JobState::Failed => -10,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        match code {
            10 => Some(JobState::Queued),
            20 => Some(JobState::Running),
            30 => Some(JobState::Done),
            -10 => Some(JobState::Failed),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Done => "DONE",
            JobState::Failed => "FAILED",
        }
    }

    fn all() -> &'static [Self] {
        &[
            JobState::Failed,
            JobState::Queued,
            JobState::Running,
            JobState::Done,
        ]
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub meta: EntityMeta,
    pub label: String,
    pub locked: bool,
}

impl Job {
    pub fn new(label: &str, state: JobState, state_timestamp: i64) -> Self {
        Self {
            meta: EntityMeta::new(EntityId::new(), state.code(), state_timestamp),
            label: label.to_string(),
            locked: false,
        }
    }
}

impl StatefulEntity for Job {
    type State = JobState;

    const KIND: &'static str = "job";
    const INDEXED_PROPERTIES: &'static [&'static str] = &["label"];

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn deletion_blocker(&self) -> Option<String> {
        self.locked.then(|| "job is locked".to_string())
    }

    fn property(&self, path: &str) -> Option<PropertyValue> {
        match path {
            "label" => Some(PropertyValue::from(self.label.as_str())),
            other => self.meta.property(other),
        }
    }
}
