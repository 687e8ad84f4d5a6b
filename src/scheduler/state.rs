//! Process-wide scheduling state.
//!
//! ```text
//!   add_request()          admit_waiting()
//!        │                       │
//!        ▼                       ▼
//!   ┌─────────┐  front   ┌───────────┐ back
//!   │ Waiting │ ───────► │  Running  │ ──┐
//!   │  Queue  │          │   Queue   │   │ preempt_last_running()
//!   └─────────┘          └───────────┘   │
//!        ▲ front               │         │
//!        └─────────────────────┼─────────┘
//!                              ▼
//!                   reclaim_finished()
//! ```
//!
//! Queues hold request ids; the states themselves live in one map keyed by
//! id, so queue reordering never invalidates a reference.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;

use crate::core::request::{Request, RequestId, RequestState, SampleResult};
use crate::core::sequence_id::{SequenceId, SequenceIdAllocator};
use crate::error::{Error, Result};
use crate::model::Model;

/// Aggregate engine statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    /// Sequence positions occupied by all running requests.
    pub current_total_seq_len: usize,
    /// Summed prefill time of finished requests, in seconds.
    pub request_total_prefill_time: f64,
    /// Summed input length of finished requests.
    pub total_prefill_length: usize,
    /// Summed decode time of finished requests, in seconds.
    pub request_total_decode_time: f64,
    /// Summed generated length of finished requests.
    pub total_decode_length: usize,
}

#[derive(Serialize)]
struct StatsReport<'a> {
    #[serde(flatten)]
    stats: &'a EngineStats,
    prefill_tokens_per_s: f64,
    decode_tokens_per_s: f64,
}

impl EngineStats {
    /// Statistics plus derived throughput as a JSON object.
    pub fn as_json(&self) -> Result<String> {
        let per_second = |len: usize, secs: f64| if secs > 0.0 { len as f64 / secs } else { 0.0 };
        let report = StatsReport {
            stats: self,
            prefill_tokens_per_s: per_second(self.total_prefill_length, self.request_total_prefill_time),
            decode_tokens_per_s: per_second(self.total_decode_length, self.request_total_decode_time),
        };
        Ok(serde_json::to_string(&report)?)
    }

    /// Zero the cumulative counters. The occupied length tracks live
    /// requests and is left alone.
    pub fn reset(&mut self) {
        *self = Self {
            current_total_seq_len: self.current_total_seq_len,
            ..Default::default()
        };
    }

    pub(crate) fn release_seq_len(&mut self, len: usize) -> Result<()> {
        self.current_total_seq_len = self.current_total_seq_len.checked_sub(len).ok_or_else(|| {
            tracing::error!(
                current = self.current_total_seq_len,
                release = len,
                "occupied length underflow"
            );
            Error::consistency(format!(
                "releasing {len} positions with only {} occupied",
                self.current_total_seq_len
            ))
        })?;
        Ok(())
    }
}

/// Scheduling state shared by all engine actions.
#[derive(Debug)]
pub struct EngineState {
    pub(crate) running_queue: VecDeque<RequestId>,
    pub(crate) waiting_queue: VecDeque<RequestId>,
    pub(crate) request_states: HashMap<RequestId, RequestState>,
    pub(crate) id_manager: SequenceIdAllocator,
    num_models: usize,
    pub(crate) stats: EngineStats,
}

impl EngineState {
    /// Create an empty state for `num_models` model replicas sharing an id
    /// space of `max_sequence_ids`.
    pub fn new(num_models: usize, max_sequence_ids: usize) -> Self {
        Self {
            running_queue: VecDeque::new(),
            waiting_queue: VecDeque::new(),
            request_states: HashMap::new(),
            id_manager: SequenceIdAllocator::new(max_sequence_ids),
            num_models: num_models.max(1),
            stats: EngineStats::default(),
        }
    }

    /// Add a new request at the back of the waiting queue.
    pub fn add_request(&mut self, request: Request) -> Result<()> {
        if self.request_states.contains_key(&request.id) {
            return Err(Error::DuplicateRequest(request.id));
        }
        if request.input_total_length() == 0 {
            return Err(Error::Tokenization(format!("request {} has an empty prompt", request.id)));
        }
        let id = request.id.clone();
        tracing::debug!(request_id = %id, input_len = request.input_total_length(), "request added");
        self.request_states
            .insert(id.clone(), RequestState::new(request, self.num_models));
        self.waiting_queue.push_back(id);
        Ok(())
    }

    /// Look up the state of an admitted request.
    pub fn get_request_state(&self, id: &str) -> Result<&RequestState> {
        self.request_states
            .get(id)
            .ok_or_else(|| Error::RequestNotFound(id.to_string()))
    }

    /// Mutable lookup of an admitted request.
    pub fn get_request_state_mut(&mut self, id: &str) -> Result<&mut RequestState> {
        self.request_states
            .get_mut(id)
            .ok_or_else(|| Error::RequestNotFound(id.to_string()))
    }

    pub fn running_queue(&self) -> &VecDeque<RequestId> {
        &self.running_queue
    }

    pub fn waiting_queue(&self) -> &VecDeque<RequestId> {
        &self.waiting_queue
    }

    pub fn num_running(&self) -> usize {
        self.running_queue.len()
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting_queue.len()
    }

    pub fn num_requests(&self) -> usize {
        self.request_states.len()
    }

    pub fn num_models(&self) -> usize {
        self.num_models
    }

    /// Whether any request is waiting or running.
    pub fn has_pending_requests(&self) -> bool {
        !self.request_states.is_empty()
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut EngineStats {
        &mut self.stats
    }

    /// Number of live sequence ids.
    pub fn num_live_sequence_ids(&self) -> usize {
        self.id_manager.num_live()
    }

    /// Append a committed token to one replica of a request.
    ///
    /// Commits on the primary replica grow the occupied length by one, except
    /// for the very first token, which is not yet in the KV cache.
    pub fn commit_token(&mut self, id: &str, model_index: usize, sample: SampleResult) -> Result<()> {
        if !self.running_queue.iter().any(|r| r == id) {
            return Err(Error::NotRunning(id.to_string()));
        }
        let state = self
            .request_states
            .get_mut(id)
            .ok_or_else(|| Error::RequestNotFound(id.to_string()))?;
        let before = state.occupied_len();
        let mstate = state.mstates_mut().get_mut(model_index).ok_or_else(|| {
            Error::consistency(format!("request {id} has no model state {model_index}"))
        })?;
        mstate.commit_token(sample);
        if model_index == 0 {
            self.stats.current_total_seq_len += state.occupied_len() - before;
        }
        Ok(())
    }

    /// Record the end of prefill for a request.
    pub fn mark_prefill_finished(&mut self, id: &str) -> Result<()> {
        self.get_request_state_mut(id)?.mark_prefill_finished();
        Ok(())
    }

    /// Move requests from the front of the waiting queue to the back of the
    /// running queue.
    ///
    /// Admission stops at the first request `can_admit` rejects or once
    /// `max_num_seqs` requests run. The predicate sees the candidate and the
    /// models it would be registered with. Each admitted request gets a fresh
    /// sequence id registered with every model; an id retained since a
    /// preemption is recycled just before. Returns the admitted ids.
    pub fn admit_waiting<P>(
        &mut self,
        models: &mut [Box<dyn Model>],
        max_num_seqs: usize,
        mut can_admit: P,
    ) -> Result<Vec<RequestId>>
    where
        P: FnMut(&RequestState, &[Box<dyn Model>]) -> bool,
    {
        let mut admitted = Vec::new();

        while self.running_queue.len() < max_num_seqs {
            let Some(id) = self.waiting_queue.front().cloned() else {
                break;
            };
            if !can_admit(self.get_request_state(&id)?, &*models) {
                break;
            }

            // A preempted request still holds the id its models released.
            // Returning it first keeps preemption from draining the id space.
            let state = self.get_request_state_mut(&id)?;
            let stale = state.primary().internal_id();
            if let Some(stale) = stale {
                for mstate in state.mstates_mut() {
                    mstate.set_internal_id(None);
                }
                self.recycle_sequence_id(stale)?;
            }

            let fresh = self.id_manager.allocate()?;
            for model in models.iter_mut() {
                model.add_sequence(fresh)?;
            }

            let state = self.get_request_state_mut(&id)?;
            for mstate in state.mstates_mut() {
                mstate.set_internal_id(Some(fresh));
            }
            let occupied = state.occupied_len();

            self.waiting_queue.pop_front();
            self.running_queue.push_back(id.clone());
            self.stats.current_total_seq_len += occupied;
            tracing::debug!(request_id = %id, sequence_id = fresh, occupied, "request admitted");
            admitted.push(id);
        }

        Ok(admitted)
    }

    /// Cancel a request.
    ///
    /// A running request finishes with an abort reason at the next post-step
    /// pass, which also reclaims it. A waiting request holds no model
    /// resources and is dropped immediately.
    pub fn abort_request(&mut self, id: &str) -> Result<()> {
        if self.running_queue.iter().any(|r| r == id) {
            self.get_request_state_mut(id)?.abort();
            tracing::debug!(request_id = %id, "abort injected for running request");
            return Ok(());
        }

        let pos = self
            .waiting_queue
            .iter()
            .position(|r| r == id)
            .ok_or_else(|| Error::RequestNotFound(id.to_string()))?;
        self.waiting_queue.remove(pos);
        let state = self
            .request_states
            .remove(id)
            .ok_or_else(|| Error::RequestNotFound(id.to_string()))?;
        if let Some(stale) = state.primary().internal_id() {
            self.recycle_sequence_id(stale)?;
        }
        tracing::debug!(request_id = %id, "waiting request aborted");
        Ok(())
    }

    /// Return a sequence id to the allocator.
    ///
    /// Debug builds verify that no remaining request state references it.
    pub(crate) fn recycle_sequence_id(&mut self, seq_id: SequenceId) -> Result<()> {
        debug_assert!(
            !self
                .request_states
                .values()
                .flat_map(|s| s.mstates())
                .any(|m| m.internal_id() == Some(seq_id)),
            "sequence id {seq_id} recycled while still referenced"
        );
        self.id_manager.recycle(seq_id)
    }

    /// Verify the queue partition and buffer invariants.
    ///
    /// Meant to be called between steps, once every running request has been
    /// through a forward pass.
    pub fn check_invariants(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for id in self.running_queue.iter().chain(&self.waiting_queue) {
            if !seen.insert(id.as_str()) {
                return Err(Error::consistency(format!("request {id} queued twice")));
            }
            if !self.request_states.contains_key(id) {
                return Err(Error::consistency(format!("queued request {id} has no state")));
            }
        }
        if seen.len() != self.request_states.len() {
            return Err(Error::consistency(format!(
                "{} request states but {} queued requests",
                self.request_states.len(),
                seen.len()
            )));
        }

        let mut expected_len = 0;
        let mut live_ids = HashSet::new();
        for id in &self.running_queue {
            let state = self.get_request_state(id)?;
            let primary = state.primary();
            if !primary.inputs().is_empty() {
                return Err(Error::consistency(format!("running request {id} has pending inputs")));
            }
            if primary.committed_tokens().is_empty() {
                return Err(Error::consistency(format!("running request {id} has no committed tokens")));
            }
            expected_len += state.occupied_len();
        }
        for id in &self.waiting_queue {
            let state = self.get_request_state(id)?;
            for mstate in state.mstates() {
                if !mstate.draft_tokens().is_empty() {
                    return Err(Error::consistency(format!("waiting request {id} has draft tokens")));
                }
                if mstate.inputs().is_empty() {
                    return Err(Error::consistency(format!("waiting request {id} has no inputs")));
                }
            }
        }
        for state in self.request_states.values() {
            if let Some(seq_id) = state.primary().internal_id() {
                if !live_ids.insert(seq_id) || !self.id_manager.is_live(seq_id) {
                    return Err(Error::consistency(format!(
                        "sequence id {seq_id} of request {} is shared or not live",
                        state.id()
                    )));
                }
            }
        }
        if live_ids.len() != self.id_manager.num_live() {
            return Err(Error::consistency(format!(
                "{} live sequence ids but {} referenced",
                self.id_manager.num_live(),
                live_ids.len()
            )));
        }
        if expected_len != self.stats.current_total_seq_len {
            return Err(Error::consistency(format!(
                "occupied length {} does not match running requests ({expected_len})",
                self.stats.current_total_seq_len
            )));
        }
        Ok(())
    }
}
