// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Waiting,
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub group: String,
    pub message: String,
    pub worker: Option<String>,
}

/// A job as stored by the queue. `data` is never interpreted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub jid: String,
    pub klass: String,
    pub queue: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub retries: u32,
    pub remaining: u32,
    pub state: JobState,
    #[serde(default)]
    pub worker: Option<String>,
    #[serde(default)]
    pub tracked: bool,
    #[serde(default)]
    pub failure: Option<Failure>,
    /// Nanoseconds since the epoch when the job was put.
    pub created: u128,
}

/// What a caller provides to `put`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub klass: String,
    pub data: serde_json::Value,
    pub priority: i64,
    pub tags: Vec<String>,
    pub retries: u32,
    pub jid: Option<String>,
}

impl NewJob {
    pub fn new(klass: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            klass: klass.into(),
            data,
            priority: 0,
            tags: Vec::new(),
            retries: 5,
            jid: None,
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn jid(mut self, jid: impl Into<String>) -> Self {
        self.jid = Some(jid.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub name: String,
    pub waiting: usize,
    pub running: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounts {
    pub name: String,
    pub jobs: usize,
}
