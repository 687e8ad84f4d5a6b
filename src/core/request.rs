//! Request tracking for the scheduling core.
//!
//! A [`Request`] is the immutable descriptor a caller submits. While the
//! request is admitted, the engine owns a [`RequestState`] holding one
//! [`RequestModelState`] per participating model (index 0 is the primary
//! replica used for length accounting and resource release).
//!
//! ```text
//!   RequestState
//!   ├── request            (id, input chunks, generation config, tadd)
//!   ├── mstates[0]         primary: committed / inputs / drafts
//!   ├── mstates[1..]       e.g. draft model for speculation
//!   └── reporting cursor   committed tokens already streamed
//! ```

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::GenerationConfig;
use crate::core::data::{total_length, InputChunk};
use crate::core::sequence_id::SequenceId;
use crate::error::{Error, Result};
use crate::tokenizer::Tokenizer;

/// Caller-visible identity of a request.
pub type RequestId = String;

/// A sampled token together with its sampling metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleResult {
    /// Sampled token id and its logprob.
    pub sampled_token_id: (u32, f32),
    /// Top alternatives (token id, logprob), best first.
    pub top_prob_tokens: Vec<(u32, f32)>,
}

#[derive(Serialize)]
struct TokenLogprob {
    token: String,
    logprob: f32,
}

#[derive(Serialize)]
struct LogprobEntry {
    token: String,
    logprob: f32,
    top_logprobs: Vec<TokenLogprob>,
}

impl SampleResult {
    /// A sample without alternatives.
    pub fn new(token_id: u32, logprob: f32) -> Self {
        Self {
            sampled_token_id: (token_id, logprob),
            top_prob_tokens: Vec::new(),
        }
    }

    /// Attach top alternatives.
    pub fn with_top(mut self, top_prob_tokens: Vec<(u32, f32)>) -> Self {
        self.top_prob_tokens = top_prob_tokens;
        self
    }

    /// The sampled token id.
    pub fn token_id(&self) -> u32 {
        self.sampled_token_id.0
    }

    /// Render this sample as a logprob JSON string with up to `top_n`
    /// alternatives.
    pub fn logprob_json(&self, tokenizer: &dyn Tokenizer, top_n: usize) -> Result<String> {
        let token_text = |id: u32| {
            tokenizer
                .id_to_token(id)
                .ok_or_else(|| Error::Tokenization(format!("unknown token id {id}")))
        };

        let top_logprobs = self
            .top_prob_tokens
            .iter()
            .take(top_n)
            .map(|&(id, logprob)| {
                Ok(TokenLogprob {
                    token: token_text(id)?,
                    logprob,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let entry = LogprobEntry {
            token: token_text(self.sampled_token_id.0)?,
            logprob: self.sampled_token_id.1,
            top_logprobs,
        };
        Ok(serde_json::to_string(&entry)?)
    }
}

/// Reason a request finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// A stop token id or stop string from the generation config matched.
    Stop,
    /// The tokenizer's end-of-sequence token was committed.
    EndOfSequence,
    /// Max sequence length or max new tokens reached.
    Length,
    /// Cancelled by the caller.
    Abort,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::EndOfSequence => "eos",
            Self::Length => "length",
            Self::Abort => "abort",
        }
    }
}

/// Immutable request descriptor.
#[derive(Debug, Clone)]
pub struct Request {
    /// Unique request id.
    pub id: RequestId,
    inputs: Vec<InputChunk>,
    /// Generation configuration.
    pub generation_config: GenerationConfig,
    /// Time the request was added to the engine.
    pub tadd: Instant,
    input_total_length: usize,
}

impl Request {
    /// Create a request stamped with the current time.
    pub fn new(
        id: impl Into<RequestId>,
        inputs: Vec<InputChunk>,
        generation_config: GenerationConfig,
    ) -> Self {
        let input_total_length = total_length(&inputs);
        Self {
            id: id.into(),
            inputs,
            generation_config,
            tadd: Instant::now(),
            input_total_length,
        }
    }

    /// Convenience constructor for a single plain-token prompt.
    pub fn from_tokens(
        id: impl Into<RequestId>,
        prompt: Vec<u32>,
        generation_config: GenerationConfig,
    ) -> Self {
        Self::new(id, vec![InputChunk::Tokens(prompt)], generation_config)
    }

    /// Original input chunks.
    pub fn inputs(&self) -> &[InputChunk] {
        &self.inputs
    }

    /// Number of sequence positions the original input occupies.
    pub fn input_total_length(&self) -> usize {
        self.input_total_length
    }
}

/// Per-(request, model) generation state.
#[derive(Debug, Clone)]
pub struct RequestModelState {
    model_index: usize,
    internal_id: Option<SequenceId>,
    committed_tokens: Vec<SampleResult>,
    inputs: Vec<InputChunk>,
    draft_tokens: Vec<SampleResult>,
}

impl RequestModelState {
    /// Fresh state for `model_index` with all of `inputs` still pending.
    pub fn new(model_index: usize, inputs: Vec<InputChunk>) -> Self {
        Self {
            model_index,
            internal_id: None,
            committed_tokens: Vec::new(),
            inputs,
            draft_tokens: Vec::new(),
        }
    }

    pub fn model_index(&self) -> usize {
        self.model_index
    }

    /// Sequence id while attached to the Model collaborators.
    pub fn internal_id(&self) -> Option<SequenceId> {
        self.internal_id
    }

    pub fn committed_tokens(&self) -> &[SampleResult] {
        &self.committed_tokens
    }

    /// Token ids of all committed tokens.
    pub fn committed_token_ids(&self) -> Vec<u32> {
        self.committed_tokens.iter().map(SampleResult::token_id).collect()
    }

    /// Input chunks not yet consumed by a forward pass.
    pub fn inputs(&self) -> &[InputChunk] {
        &self.inputs
    }

    pub fn draft_tokens(&self) -> &[SampleResult] {
        &self.draft_tokens
    }

    /// Append a finalized token.
    pub fn commit_token(&mut self, sample: SampleResult) {
        self.committed_tokens.push(sample);
    }

    /// Append a speculative token.
    pub fn add_draft_token(&mut self, sample: SampleResult) {
        self.draft_tokens.push(sample);
    }

    /// Drop the last `n` speculative tokens (rejected by verification).
    pub fn remove_last_draft_tokens(&mut self, n: usize) {
        let keep = self.draft_tokens.len().saturating_sub(n);
        self.draft_tokens.truncate(keep);
    }

    /// Drop all speculative tokens.
    pub fn remove_all_draft_tokens(&mut self) {
        self.draft_tokens.clear();
    }

    /// Hand pending inputs to a forward pass, leaving none behind.
    pub fn take_inputs(&mut self) -> Vec<InputChunk> {
        std::mem::take(&mut self.inputs)
    }

    pub(crate) fn set_inputs(&mut self, inputs: Vec<InputChunk>) {
        self.inputs = inputs;
    }

    pub(crate) fn set_internal_id(&mut self, id: Option<SequenceId>) {
        self.internal_id = id;
    }
}

/// Newly produced output of a request since the previous report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReturnDelta {
    /// New token ids.
    pub token_ids: Vec<u32>,
    /// One logprob JSON string per new token, when requested.
    pub logprob_json_strs: Option<Vec<String>>,
    /// Set when the request finished with this delta.
    pub finish_reason: Option<FinishReason>,
}

impl ReturnDelta {
    /// Nothing to report: no tokens and no finish.
    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty() && self.finish_reason.is_none()
    }
}

/// Engine-owned state of an admitted request.
#[derive(Debug)]
pub struct RequestState {
    request: Request,
    mstates: Vec<RequestModelState>,
    tprefill_finish: Option<Instant>,
    /// Number of primary committed tokens already reported.
    next_callback_token_pos: usize,
    finish_reason: Option<FinishReason>,
    abort_requested: bool,
}

impl RequestState {
    /// Create the state for `request` with one model state per model.
    pub fn new(request: Request, num_models: usize) -> Self {
        let mstates = (0..num_models.max(1))
            .map(|i| RequestModelState::new(i, request.inputs.clone()))
            .collect();
        Self {
            request,
            mstates,
            tprefill_finish: None,
            next_callback_token_pos: 0,
            finish_reason: None,
            abort_requested: false,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn id(&self) -> &str {
        &self.request.id
    }

    pub fn mstates(&self) -> &[RequestModelState] {
        &self.mstates
    }

    pub fn mstates_mut(&mut self) -> &mut [RequestModelState] {
        &mut self.mstates
    }

    /// The primary replica.
    pub fn primary(&self) -> &RequestModelState {
        &self.mstates[0]
    }

    pub fn tprefill_finish(&self) -> Option<Instant> {
        self.tprefill_finish
    }

    /// Record the end of the primary replica's prefill. Only the first call
    /// takes effect.
    pub fn mark_prefill_finished(&mut self) {
        if self.tprefill_finish.is_none() {
            self.tprefill_finish = Some(Instant::now());
        }
    }

    /// Reported finish reason, once the request finished.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Ask for the request to finish with [`FinishReason::Abort`] at the next
    /// delta computation.
    pub fn abort(&mut self) {
        self.abort_requested = true;
    }

    /// Whether an abort is pending or was reported.
    pub fn is_abort_requested(&self) -> bool {
        self.abort_requested
    }

    /// Sequence positions occupied in the KV caches:
    /// input length + committed tokens - 1. The last committed token has not
    /// been fed back yet.
    pub fn occupied_len(&self) -> usize {
        self.request.input_total_length() + self.primary().committed_tokens.len().saturating_sub(1)
    }

    /// Compute the output delta since the previous call.
    ///
    /// Scans new primary committed tokens in order and stops at the first one
    /// that finishes the request. When several conditions hold at the same
    /// token the reported reason is, in priority order: stop token/string,
    /// end-of-sequence, length. A pending abort wins over everything.
    ///
    /// On error nothing is consumed: the reporting cursor and finish reason
    /// stay where they were.
    pub fn compute_return_delta(
        &mut self,
        tokenizer: &dyn Tokenizer,
        max_single_sequence_length: usize,
    ) -> Result<ReturnDelta> {
        self.compute_delta(tokenizer, max_single_sequence_length, true)
    }

    /// Like [`compute_return_delta`](Self::compute_return_delta), but never
    /// renders logprob strings, even when the config asks for them.
    pub fn compute_return_delta_without_logprobs(
        &mut self,
        tokenizer: &dyn Tokenizer,
        max_single_sequence_length: usize,
    ) -> Result<ReturnDelta> {
        self.compute_delta(tokenizer, max_single_sequence_length, false)
    }

    fn compute_delta(
        &mut self,
        tokenizer: &dyn Tokenizer,
        max_single_sequence_length: usize,
        render_logprobs: bool,
    ) -> Result<ReturnDelta> {
        if self.finish_reason.is_some() {
            return Ok(ReturnDelta::default());
        }

        let committed = &self.mstates[0].committed_tokens;
        if self.abort_requested {
            self.next_callback_token_pos = committed.len();
            self.finish_reason = Some(FinishReason::Abort);
            return Ok(ReturnDelta {
                finish_reason: Some(FinishReason::Abort),
                ..Default::default()
            });
        }

        let config = &self.request.generation_config;
        let eos = if config.ignore_eos {
            None
        } else {
            tokenizer.eos_token_id()
        };
        let prompt_len = self.request.input_total_length();

        let mut delta = ReturnDelta {
            logprob_json_strs: (render_logprobs && config.logprobs > 0).then(Vec::new),
            ..Default::default()
        };
        let mut cursor = self.next_callback_token_pos;

        for sample in &committed[self.next_callback_token_pos.min(committed.len())..] {
            let token_id = sample.token_id();
            delta.token_ids.push(token_id);
            if let Some(strs) = delta.logprob_json_strs.as_mut() {
                strs.push(sample.logprob_json(tokenizer, config.logprobs)?);
            }
            cursor += 1;

            let hit_stop = config.stop_token_ids.contains(&token_id)
                || contains_stop_str(tokenizer, &committed[..cursor], &config.stop_strs)?;
            let reason = if hit_stop {
                Some(FinishReason::Stop)
            } else if eos == Some(token_id) {
                Some(FinishReason::EndOfSequence)
            } else if prompt_len + cursor >= max_single_sequence_length
                || cursor >= config.max_tokens
            {
                Some(FinishReason::Length)
            } else {
                None
            };

            if reason.is_some() {
                delta.finish_reason = reason;
                break;
            }
        }

        self.next_callback_token_pos = cursor;
        self.finish_reason = delta.finish_reason;
        Ok(delta)
    }
}

fn contains_stop_str(
    tokenizer: &dyn Tokenizer,
    generated: &[SampleResult],
    stop_strs: &[String],
) -> Result<bool> {
    if stop_strs.is_empty() {
        return Ok(false);
    }
    let ids: Vec<u32> = generated.iter().map(SampleResult::token_id).collect();
    let text = tokenizer.decode(&ids)?;
    Ok(stop_strs.iter().any(|s| !s.is_empty() && text.contains(s.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::ByteTokenizer;

    fn state(prompt_len: usize, config: GenerationConfig) -> RequestState {
        let request = Request::from_tokens("r0", vec![1; prompt_len], config);
        RequestState::new(request, 1)
    }

    #[test]
    fn test_new_state_copies_inputs_to_every_model() {
        let request = Request::from_tokens("r0", vec![1, 2, 3], GenerationConfig::default());
        let state = RequestState::new(request, 2);

        assert_eq!(state.mstates().len(), 2);
        for mstate in state.mstates() {
            assert_eq!(mstate.inputs(), &[InputChunk::Tokens(vec![1, 2, 3])]);
            assert!(mstate.internal_id().is_none());
        }
    }

    #[test]
    fn test_draft_bookkeeping() {
        let mut mstate = RequestModelState::new(0, Vec::new());
        for t in 10..14 {
            mstate.add_draft_token(SampleResult::new(t, -0.1));
        }
        mstate.remove_last_draft_tokens(3);
        assert_eq!(mstate.draft_tokens().len(), 1);
        mstate.remove_last_draft_tokens(5);
        assert!(mstate.draft_tokens().is_empty());
    }

    #[test]
    fn test_occupied_len() {
        let mut state = state(10, GenerationConfig::default());
        assert_eq!(state.occupied_len(), 10);
        for t in [5, 7, 2] {
            state.mstates_mut()[0].commit_token(SampleResult::new(t, 0.0));
        }
        assert_eq!(state.occupied_len(), 12);
    }

    #[test]
    fn test_delta_stops_at_first_finishing_token() {
        let mut state = state(4, GenerationConfig::default().stop_token(9));
        for t in [5, 9, 6] {
            state.mstates_mut()[0].commit_token(SampleResult::new(t, 0.0));
        }
        let delta = state
            .compute_return_delta(&ByteTokenizer::new(None), 1024)
            .unwrap();
        assert_eq!(delta.token_ids, vec![5, 9]);
        assert_eq!(delta.finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn test_failed_delta_consumes_nothing() {
        let mut state = state(4, GenerationConfig::default().logprobs(1));
        state.mstates_mut()[0].commit_token(SampleResult::new(b'a' as u32, 0.0));
        state.mstates_mut()[0].commit_token(SampleResult::new(300, 0.0));
        state.mstates_mut()[0].commit_token(SampleResult::new(9, 0.0));

        struct NoLongIds;
        impl Tokenizer for NoLongIds {
            fn decode(&self, ids: &[u32]) -> Result<String> {
                ByteTokenizer::new(None).decode(ids)
            }
            fn id_to_token(&self, id: u32) -> Option<String> {
                u8::try_from(id).ok().map(|b| char::from(b).to_string())
            }
            fn eos_token_id(&self) -> Option<u32> {
                None
            }
        }

        assert!(state.compute_return_delta(&NoLongIds, 1024).is_err());
        let delta = state
            .compute_return_delta_without_logprobs(&NoLongIds, 1024)
            .unwrap();
        assert_eq!(delta.token_ids, vec![b'a' as u32, 300, 9]);
        assert!(delta.logprob_json_strs.is_none());
    }

    #[test]
    fn test_input_total_length_follows_inputs() {
        let inputs = vec![
            InputChunk::Tokens(vec![1, 2, 3]),
            InputChunk::Embedding {
                kind: "image".into(),
                length: 5,
            },
        ];
        let request = Request::new("r0", inputs.clone(), GenerationConfig::default());
        assert_eq!(request.inputs(), inputs.as_slice());
        assert_eq!(request.input_total_length(), total_length(request.inputs()));
        assert_eq!(request.input_total_length(), 8);
    }

    #[test]
    fn test_logprob_json_shape() {
        let sample = SampleResult::new(104, -0.5).with_top(vec![(104, -0.5), (105, -1.5)]);
        let json = sample.logprob_json(&ByteTokenizer::default(), 1).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["token"], "h");
        assert_eq!(value["top_logprobs"].as_array().unwrap().len(), 1);
    }
}
