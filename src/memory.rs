//! Per-session working memory.
//!
//! One in-memory scratch pad per active session: sub-goals, gathered
//! information, identified gaps, arbitrary scratch keys, and the running
//! thought chain. Not durable — purely a coordination space whose lifecycle
//! is bounded by the session. Cleanup runs on both success and failure paths.

use crate::plan::JsonMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A derived sub-goal with its heuristic category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubGoal {
    pub description: String,
    pub category: String,
}

/// Scratch state for one research session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingMemory {
    pub session_id: String,
    pub query: String,
    pub start_time: DateTime<Utc>,
    pub current_phase: Option<String>,
    pub current_step: Option<String>,
    pub primary_goal: String,
    pub sub_goals: Vec<SubGoal>,
    pub gathered_information: Vec<String>,
    pub active_hypotheses: Vec<String>,
    pub identified_gaps: Vec<String>,
    pub scratch_pad: JsonMap,
    pub thought_chain: Vec<String>,
}

impl WorkingMemory {
    pub fn new(session_id: impl Into<String>, query: impl Into<String>) -> Self {
        let query = query.into();
        Self {
            session_id: session_id.into(),
            primary_goal: format!("Answer: {query}"),
            query,
            start_time: Utc::now(),
            current_phase: None,
            current_step: None,
            sub_goals: Vec::new(),
            gathered_information: Vec::new(),
            active_hypotheses: Vec::new(),
            identified_gaps: Vec::new(),
            scratch_pad: JsonMap::new(),
            thought_chain: Vec::new(),
        }
    }

    pub fn update_phase(&mut self, name: &str, order: u32) {
        self.current_phase = Some(format!("{order}: {name}"));
        self.current_step = None;
    }

    pub fn update_step(&mut self, step_id: &str) {
        self.current_step = Some(step_id.to_string());
    }

    pub fn add_sub_goal(&mut self, description: impl Into<String>, category: impl Into<String>) {
        self.sub_goals.push(SubGoal {
            description: description.into(),
            category: category.into(),
        });
    }

    pub fn add_gathered_info(&mut self, info: impl Into<String>) {
        self.gathered_information.push(info.into());
    }

    pub fn add_gap(&mut self, gap: impl Into<String>) {
        self.identified_gaps.push(gap.into());
    }

    pub fn add_thought(&mut self, thought: impl Into<String>) {
        self.thought_chain.push(thought.into());
    }

    pub fn set_scratch(&mut self, key: impl Into<String>, value: Value) {
        self.scratch_pad.insert(key.into(), value);
    }

    /// Typed read of a scratch key. Returns `None` when the key is absent or
    /// does not deserialize to `T`.
    pub fn get_scratch<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.scratch_pad
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Registry of active sessions' working memory. Single writer, many readers
/// per session; the registry itself supports concurrent sessions.
#[derive(Default)]
pub struct MemoryRegistry {
    sessions: RwLock<HashMap<String, Arc<RwLock<WorkingMemory>>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) the working memory slot for a session.
    pub async fn initialize(
        &self,
        session_id: &str,
        query: &str,
    ) -> Arc<RwLock<WorkingMemory>> {
        let memory = Arc::new(RwLock::new(WorkingMemory::new(session_id, query)));
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), memory.clone());
        memory
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<RwLock<WorkingMemory>>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Drop a session's slot. Idempotent.
    pub async fn cleanup(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }
}
