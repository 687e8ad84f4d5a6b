//! Reference step loop.
//!
//! The LLMEngine drives the scheduling core the way a serving loop would:
//!
//! ```text
//!   add_request()                         step()
//!        │                                  │
//!        ▼                    waiting admissible?
//!   ┌──────────┐              yes │              │ no
//!   │ Waiting  │                  ▼              ▼
//!   │  queue   │          ┌──────────────┐  ┌──────────────────┐
//!   └──────────┘          │ admit_waiting│  │ preempt from back│
//!                         │   prefill    │  │ until decode fits│
//!                         └──────────────┘  │ decode running   │
//!                                 │         └──────────────────┘
//!                                 ▼                  │
//!                         ┌──────────────────────────┘
//!                         │ process_step: stream deltas once,
//!                         │ then reclaim finished requests
//!                         └──────────────
//! ```
//!
//! Each step is either a prefill step or a decode step, never both, so a
//! request is only ever preempted after its prefill produced a token.

use crate::config::{EngineConfig, GenerationConfig};
use crate::core::data::{total_length, InputChunk};
use crate::core::request::{Request, RequestId};
use crate::error::{Error, Result};
use crate::model::Model;
use crate::scheduler::{
    preempt_last_running, process_step, EngineState, EngineStats, RequestStreamOutput,
};
use crate::tokenizer::Tokenizer;
use crate::trace::{record_event, EventTraceRecorder};

/// Request for generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Unique request ID (auto-assigned if None).
    pub request_id: Option<RequestId>,
    /// Input chunks (already tokenized).
    pub inputs: Vec<InputChunk>,
    /// Generation configuration for this request.
    pub generation_config: GenerationConfig,
}

impl GenerationRequest {
    /// Create a request with default settings from prompt token ids.
    pub fn from_tokens(prompt: Vec<u32>) -> Self {
        Self::new(vec![InputChunk::Tokens(prompt)])
    }

    /// Create a request with default settings from input chunks.
    pub fn new(inputs: Vec<InputChunk>) -> Self {
        Self {
            request_id: None,
            inputs,
            generation_config: GenerationConfig::default(),
        }
    }

    /// Set an explicit request ID.
    pub fn request_id(mut self, id: impl Into<RequestId>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Set the maximum tokens to generate.
    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.generation_config.max_tokens = max_tokens;
        self
    }

    /// Replace the whole generation config.
    pub fn generation_config(mut self, config: GenerationConfig) -> Self {
        self.generation_config = config;
        self
    }
}

/// What a step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Nothing to do.
    Idle,
    /// Newly admitted requests were prefilled.
    Prefill,
    /// Running requests decoded one token each.
    Decode,
}

/// Result of one engine step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub kind: StepKind,
    /// Requests that ran a forward pass this step.
    pub scheduled: Vec<RequestId>,
    /// Requests preempted to make room for decode.
    pub preempted: Vec<RequestId>,
    /// Requests that finished and were reclaimed.
    pub finished: Vec<RequestId>,
}

impl StepOutput {
    fn idle() -> Self {
        Self {
            kind: StepKind::Idle,
            scheduled: Vec::new(),
            preempted: Vec::new(),
            finished: Vec::new(),
        }
    }
}

/// Continuous-batching engine over a set of model replicas.
pub struct LLMEngine {
    state: EngineState,
    /// One model per replica; `models[i]` serves `mstates[i]`.
    models: Vec<Box<dyn Model>>,
    tokenizer: Box<dyn Tokenizer>,
    config: EngineConfig,
    trace: Option<Box<dyn EventTraceRecorder>>,
    next_request_id: u64,
}

impl LLMEngine {
    /// Create an engine. `models` must hold at least the primary model.
    pub fn new(
        models: Vec<Box<dyn Model>>,
        tokenizer: Box<dyn Tokenizer>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        if models.is_empty() {
            return Err(Error::Config("engine needs at least one model".into()));
        }

        Ok(Self {
            state: EngineState::new(models.len(), config.max_sequence_ids),
            models,
            tokenizer,
            config,
            trace: None,
            next_request_id: 0,
        })
    }

    /// Attach a trace recorder.
    pub fn with_trace_recorder(mut self, recorder: Box<dyn EventTraceRecorder>) -> Self {
        self.trace = Some(recorder);
        self
    }

    fn trace(&mut self) -> Option<&mut dyn EventTraceRecorder> {
        self.trace.as_deref_mut().map(|t| t as &mut dyn EventTraceRecorder)
    }

    /// Add a generation request. Returns the assigned request ID.
    pub fn add_request(&mut self, request: GenerationRequest) -> Result<RequestId> {
        let id = request.request_id.unwrap_or_else(|| {
            let id = format!("req-{}", self.next_request_id);
            self.next_request_id += 1;
            id
        });

        self.state.add_request(Request::new(
            id.clone(),
            request.inputs,
            request.generation_config,
        ))?;
        record_event(self.trace(), &id, "add request");
        Ok(id)
    }

    /// Cancel a request. A running request reports an abort finish at the
    /// next step. Until then it is neither decoded nor preempted.
    pub fn abort(&mut self, id: &str) -> Result<()> {
        self.state.abort_request(id)?;
        record_event(self.trace(), id, "abort");
        Ok(())
    }

    /// Run one step, streaming outputs to `sink`.
    pub fn step<F>(&mut self, sink: &mut F) -> Result<StepOutput>
    where
        F: FnMut(Vec<RequestStreamOutput>),
    {
        if !self.state.has_pending_requests() {
            return Ok(StepOutput::idle());
        }

        let admitted = self.admit()?;
        let mut output = if !admitted.is_empty() {
            self.prefill(&admitted)?;
            StepOutput {
                kind: StepKind::Prefill,
                scheduled: admitted,
                ..StepOutput::idle()
            }
        } else if self.state.num_running() > 0 {
            let preempted = self.preempt_until_decodable()?;
            let scheduled = self.decodable()?;
            self.decode(&scheduled)?;
            StepOutput {
                kind: StepKind::Decode,
                scheduled,
                preempted,
                ..StepOutput::idle()
            }
        } else {
            // Nothing runs and the front of the waiting queue can never fit.
            let front = self.state.waiting_queue().front().cloned().unwrap_or_default();
            tracing::error!(request_id = %front, "waiting request does not fit in an empty engine");
            return Err(Error::OutOfBlocks);
        };

        // Aborted running requests report their finish along with the batch.
        let mut reported = output.scheduled.clone();
        for id in self.state.running_queue() {
            if self.state.get_request_state(id)?.is_abort_requested() && !reported.contains(id) {
                reported.push(id.clone());
            }
        }
        output.finished = process_step(
            &reported,
            &mut self.state,
            &mut self.models,
            self.tokenizer.as_ref(),
            &mut *sink,
            self.config.max_single_sequence_length,
        )?;
        for id in &output.finished {
            record_event(self.trace(), id, "finish");
        }
        Ok(output)
    }

    /// Step until no request is left.
    pub fn run_to_completion<F>(&mut self, sink: &mut F) -> Result<()>
    where
        F: FnMut(Vec<RequestStreamOutput>),
    {
        while self.state.has_pending_requests() {
            self.step(sink)?;
        }
        Ok(())
    }

    fn admit(&mut self) -> Result<Vec<RequestId>> {
        // Blocks are only taken by the forward pass, so positions promised to
        // requests admitted earlier in this step are tracked here.
        let mut reserved: Vec<usize> = Vec::new();
        let admitted = self.state.admit_waiting(
            &mut self.models,
            self.config.max_num_seqs,
            |rstate, models| {
                reserved.push(total_length(rstate.primary().inputs()));
                let fits = models.iter().all(|m| m.can_fit(&reserved));
                if !fits {
                    reserved.pop();
                }
                fits
            },
        )?;
        for id in &admitted {
            record_event(self.trace(), id, "admit");
        }
        Ok(admitted)
    }

    fn prefill(&mut self, ids: &[RequestId]) -> Result<()> {
        for id in ids {
            for model_index in 0..self.models.len() {
                let state = self.state.get_request_state_mut(id)?;
                let mstate = &mut state.mstates_mut()[model_index];
                let seq_id = mstate
                    .internal_id()
                    .ok_or_else(|| Error::consistency(format!("admitted request {id} has no sequence id")))?;
                let inputs = mstate.take_inputs();
                let sample = self.models[model_index].forward(seq_id, &inputs)?;
                self.state.commit_token(id, model_index, sample)?;
            }
            self.state.mark_prefill_finished(id)?;
            record_event(self.trace(), id, "prefill");
        }
        Ok(())
    }

    fn preempt_until_decodable(&mut self) -> Result<Vec<RequestId>> {
        let mut preempted = Vec::new();
        loop {
            let batch = self.decodable()?;
            if self.decode_fits(&batch)? {
                return Ok(preempted);
            }
            if batch.len() <= 1 {
                tracing::error!("a single running request cannot decode");
                return Err(Error::OutOfBlocks);
            }
            let trace = self.trace.as_deref_mut().map(|t| t as &mut dyn EventTraceRecorder);
            preempted.push(preempt_last_running(&mut self.state, &mut self.models, trace)?);
        }
    }

    /// Running requests without a pending abort, in running order.
    fn decodable(&self) -> Result<Vec<RequestId>> {
        let mut ids = Vec::with_capacity(self.state.num_running());
        for id in self.state.running_queue() {
            if !self.state.get_request_state(id)?.is_abort_requested() {
                ids.push(id.clone());
            }
        }
        Ok(ids)
    }

    fn decode_fits(&self, ids: &[RequestId]) -> Result<bool> {
        let seq_ids = ids
            .iter()
            .map(|id| {
                self.state
                    .get_request_state(id)?
                    .primary()
                    .internal_id()
                    .ok_or_else(|| Error::consistency(format!("running request {id} has no sequence id")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(self.models.iter().all(|m| m.can_decode(&seq_ids)))
    }

    fn decode(&mut self, ids: &[RequestId]) -> Result<()> {
        for id in ids {
            for model_index in 0..self.models.len() {
                let mstate = &self.state.get_request_state(id)?.mstates()[model_index];
                let seq_id = mstate
                    .internal_id()
                    .ok_or_else(|| Error::consistency(format!("running request {id} has no sequence id")))?;
                let last = mstate
                    .committed_tokens()
                    .last()
                    .map(|s| s.token_id())
                    .ok_or_else(|| Error::consistency(format!("running request {id} has no committed tokens")))?;
                let sample = self.models[model_index].forward(seq_id, &[InputChunk::Tokens(vec![last])])?;
                self.state.commit_token(id, model_index, sample)?;
            }
        }
        Ok(())
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn stats(&self) -> &EngineStats {
        self.state.stats()
    }

    pub fn models(&self) -> &[Box<dyn Model>] {
        &self.models
    }

    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Check if there are pending (waiting or running) requests.
    pub fn has_pending_requests(&self) -> bool {
        self.state.has_pending_requests()
    }
}
