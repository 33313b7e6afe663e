//! In-process driver for development and tests.
//!
//! One mutex guards every queue, which makes group activation and advance
//! trivially atomic. `pop` scans each lane for the first due payload, so
//! delayed payloads can sit ahead of visible ones without blocking them.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::{BatchDriver, DeadLetterDriver, Driver, DEAD_LETTER_CAP};
use crate::error::Result;
use crate::jobs::clock::{Clock, SystemClock};
use crate::jobs::job::JobPriority;
use crate::jobs::payload::Payload;

#[derive(Debug, Default)]
struct QueueState {
    /// Indexed in probe order: critical, high, normal, low
    lanes: [VecDeque<Payload>; 4],
    active_groups: HashSet<String>,
    pending: HashMap<String, VecDeque<Payload>>,
    /// Newest first
    dead: VecDeque<Payload>,
}

fn lane_index(priority: Option<JobPriority>) -> usize {
    match priority.unwrap_or_default() {
        JobPriority::Critical => 0,
        JobPriority::High => 1,
        JobPriority::Normal => 2,
        JobPriority::Low => 3,
    }
}

impl QueueState {
    fn enqueue(&mut self, payload: Payload) {
        if let Some(group) = payload.group_id.clone() {
            if self.active_groups.contains(&group) {
                self.pending.entry(group).or_default().push_back(payload);
                return;
            }
            self.active_groups.insert(group);
        }
        self.lanes[lane_index(payload.priority)].push_back(payload);
    }

    fn take_due(&mut self, now_ms: i64) -> Option<Payload> {
        for lane in self.lanes.iter_mut() {
            if let Some(pos) = lane.iter().position(|p| p.is_due(now_ms)) {
                return lane.remove(pos);
            }
        }
        None
    }

    /// Release the group's slot to its next pending payload.
    fn advance_group(&mut self, group: &str) {
        let next = self.pending.get_mut(group).and_then(VecDeque::pop_front);
        if self.pending.get(group).is_some_and(VecDeque::is_empty) {
            self.pending.remove(group);
        }
        match next {
            Some(payload) => self.lanes[lane_index(payload.priority)].push_back(payload),
            None => {
                self.active_groups.remove(group);
            }
        }
    }

    fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum::<usize>()
            + self.pending.values().map(VecDeque::len).sum::<usize>()
    }
}

/// Driver that keeps every queue in process memory.
pub struct MemoryDriver {
    queues: Mutex<HashMap<String, QueueState>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    async fn push(&self, queue: &str, payload: Payload) -> Result<()> {
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .enqueue(payload);
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<Payload>> {
        let now = self.clock.now_ms();
        Ok(self
            .queues
            .lock()
            .get_mut(queue)
            .and_then(|state| state.take_due(now)))
    }

    async fn size(&self, queue: &str) -> Result<u64> {
        Ok(self.queues.lock().get(queue).map_or(0, |s| s.len() as u64))
    }

    async fn clear(&self, queue: &str) -> Result<()> {
        if let Some(state) = self.queues.lock().get_mut(queue) {
            state.lanes = Default::default();
            state.active_groups.clear();
            state.pending.clear();
        }
        Ok(())
    }

    async fn complete(&self, queue: &str, payload: &Payload) -> Result<()> {
        if let Some(group) = &payload.group_id {
            if let Some(state) = self.queues.lock().get_mut(queue) {
                state.advance_group(group);
            }
        }
        Ok(())
    }

    async fn fail(&self, queue: &str, payload: &Payload) -> Result<()> {
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        state.dead.push_front(payload.clone());
        state.dead.truncate(DEAD_LETTER_CAP);
        if let Some(group) = &payload.group_id {
            state.advance_group(group);
        }
        Ok(())
    }

    fn as_batch(&self) -> Option<&dyn BatchDriver> {
        Some(self)
    }

    fn as_dead_letter(&self) -> Option<&dyn DeadLetterDriver> {
        Some(self)
    }
}

#[async_trait]
impl BatchDriver for MemoryDriver {
    async fn push_many(&self, queue: &str, payloads: Vec<Payload>) -> Result<()> {
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        for payload in payloads {
            state.enqueue(payload);
        }
        Ok(())
    }

    async fn pop_many(&self, queue: &str, max: usize) -> Result<Vec<Payload>> {
        let now = self.clock.now_ms();
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(max.min(64));
        while out.len() < max {
            match state.take_due(now) {
                Some(payload) => out.push(payload),
                None => break,
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl DeadLetterDriver for MemoryDriver {
    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<Payload>> {
        Ok(self
            .queues
            .lock()
            .get(queue)
            .map(|s| s.dead.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn retry_dead_letter(&self, queue: &str) -> Result<Option<Payload>> {
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };
        let Some(mut payload) = state.dead.pop_back() else {
            return Ok(None);
        };
        payload.reset_for_retry();
        state.enqueue(payload.clone());
        Ok(Some(payload))
    }

    async fn purge_dead_letters(&self, queue: &str) -> Result<u64> {
        Ok(self
            .queues
            .lock()
            .get_mut(queue)
            .map_or(0, |s| s.dead.drain(..).count() as u64))
    }

    async fn dead_letter_size(&self, queue: &str) -> Result<u64> {
        Ok(self.queues.lock().get(queue).map_or(0, |s| s.dead.len() as u64))
    }
}
