//! Post-step processing: streaming deltas and finishing requests.

use serde::Serialize;

use crate::core::request::{FinishReason, RequestId};
use crate::error::Result;
use crate::model::Model;
use crate::scheduler::reclaim::reclaim_finished;
use crate::scheduler::state::EngineState;
use crate::tokenizer::Tokenizer;

/// One request's output for one step, as delivered to the stream sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestStreamOutput {
    pub request_id: RequestId,
    pub delta_token_ids: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_logprob_json_strs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

/// Stream outputs of `requests`, then reclaim the ones that finished.
///
/// Requests with nothing new are skipped. `stream_sink` is called exactly
/// once with all outputs in `requests` order, possibly with none, and
/// returns before any finished request is reclaimed. Returns the ids of the
/// finished requests.
///
/// A request whose output cannot be rendered does not hold up the batch. If
/// its logprob strings fail it is reported without them; if its tokens
/// cannot be decoded at all it finishes with [`FinishReason::Abort`].
pub fn process_step<F>(
    requests: &[RequestId],
    estate: &mut EngineState,
    models: &mut [Box<dyn Model>],
    tokenizer: &dyn Tokenizer,
    stream_sink: F,
    max_single_sequence_length: usize,
) -> Result<Vec<RequestId>>
where
    F: FnOnce(Vec<RequestStreamOutput>),
{
    let mut outputs = Vec::with_capacity(requests.len());
    let mut finished = Vec::new();

    for id in requests {
        let state = estate.get_request_state_mut(id)?;
        let delta = match state.compute_return_delta(tokenizer, max_single_sequence_length) {
            Ok(delta) => delta,
            Err(e) if !e.is_fatal() => {
                tracing::warn!(request_id = %id, error = %e, "dropping logprobs for request");
                match state.compute_return_delta_without_logprobs(tokenizer, max_single_sequence_length) {
                    Ok(delta) => delta,
                    Err(e) if !e.is_fatal() => {
                        tracing::error!(request_id = %id, error = %e, "cannot render output, aborting request");
                        state.abort();
                        state.compute_return_delta(tokenizer, max_single_sequence_length)?
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };
        if delta.is_empty() {
            continue;
        }

        let logprobs_requested = state.request().generation_config.logprobs > 0;
        if delta.finish_reason.is_some() {
            finished.push(id.clone());
        }
        outputs.push(RequestStreamOutput {
            request_id: id.clone(),
            delta_token_ids: delta.token_ids,
            delta_logprob_json_strs: delta.logprob_json_strs.filter(|_| logprobs_requested),
            finish_reason: delta.finish_reason,
        });
    }

    tracing::trace!(num_outputs = outputs.len(), num_finished = finished.len(), "streaming step outputs");
    stream_sink(outputs);

    reclaim_finished(&finished, estate, models)?;
    Ok(finished)
}
