//! Preemption of running requests.
//!
//! The victim is the last running request without a pending abort. Its
//! KV state is dropped and rebuilt later by replaying the original input
//! followed by everything it committed, so it resumes exactly where it left
//! off.

use crate::core::data::InputChunk;
use crate::core::request::RequestId;
use crate::error::{Error, Result};
use crate::model::{remove_sequence_from_models, Model};
use crate::scheduler::state::EngineState;
use crate::trace::{record_event, EventTraceRecorder};

/// Preempt the last running request and move it to the front of the
/// waiting queue. Returns the victim's id.
///
/// Requests with a pending abort are skipped.
///
/// The victim keeps its request state and its (now detached) sequence id;
/// it receives a fresh id when it is admitted again.
///
/// # Errors
///
/// Fails with [`Error::NothingToPreempt`] if nothing runs that may be
/// preempted, and with a
/// consistency error if any replica still has pending inputs or has never
/// committed a token.
pub fn preempt_last_running(
    estate: &mut EngineState,
    models: &mut [Box<dyn Model>],
    trace: Option<&mut dyn EventTraceRecorder>,
) -> Result<RequestId> {
    // Aborted requests are about to be reclaimed, so they are never victims.
    let pos = estate
        .running_queue
        .iter()
        .rposition(|id| {
            estate
                .request_states
                .get(id)
                .map_or(true, |s| !s.is_abort_requested())
        })
        .ok_or(Error::NothingToPreempt)?;
    let id = estate.running_queue[pos].clone();
    let state = estate
        .request_states
        .get_mut(&id)
        .ok_or_else(|| Error::RequestNotFound(id.clone()))?;

    for mstate in state.mstates() {
        if !mstate.inputs().is_empty() || mstate.committed_tokens().is_empty() {
            tracing::error!(
                request_id = %id,
                model_index = mstate.model_index(),
                pending_inputs = mstate.inputs().len(),
                committed = mstate.committed_tokens().len(),
                "cannot preempt a request that has not finished prefill"
            );
            return Err(Error::consistency(format!(
                "preempting request {id}: model {} has {} pending inputs and {} committed tokens",
                mstate.model_index(),
                mstate.inputs().len(),
                mstate.committed_tokens().len()
            )));
        }
    }
    let seq_id = state
        .primary()
        .internal_id()
        .ok_or_else(|| Error::consistency(format!("running request {id} has no sequence id")))?;

    record_event(trace, &id, "preempt");
    let occupied = state.occupied_len();
    estate.stats.release_seq_len(occupied)?;

    let original = state.request().inputs().to_vec();
    for mstate in state.mstates_mut() {
        mstate.remove_all_draft_tokens();
        let committed = mstate.committed_token_ids();
        mstate.set_inputs(build_replay_inputs(&original, &committed));
    }

    remove_sequence_from_models(models, seq_id)?;
    estate.running_queue.remove(pos);
    estate.waiting_queue.push_front(id.clone());

    tracing::warn!(request_id = %id, sequence_id = seq_id, released = occupied, "request preempted");
    Ok(id)
}

/// Input chunks that replay `original` followed by `committed`.
///
/// When `original` ends in a plain-token chunk the committed ids are merged
/// into it, so re-admission embeds the tokens in one pass; otherwise they
/// form a new trailing chunk.
///
/// ```
/// use nano_serve::core::data::InputChunk;
/// use nano_serve::scheduler::preempt::build_replay_inputs;
///
/// let replay = build_replay_inputs(&[InputChunk::Tokens(vec![1, 2])], &[7, 8]);
/// assert_eq!(replay, vec![InputChunk::Tokens(vec![1, 2, 7, 8])]);
/// ```
pub fn build_replay_inputs(original: &[InputChunk], committed: &[u32]) -> Vec<InputChunk> {
    let mut inputs = original.to_vec();
    match inputs.last_mut().and_then(InputChunk::as_token_ids_mut) {
        Some(tail) => tail.extend_from_slice(committed),
        None => inputs.push(InputChunk::Tokens(committed.to_vec())),
    }
    inputs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_after_embedding_appends_chunk() {
        let original = vec![
            InputChunk::Tokens(vec![1, 2]),
            InputChunk::Embedding {
                kind: "image".into(),
                length: 4,
            },
        ];
        let replay = build_replay_inputs(&original, &[9, 8]);
        assert_eq!(replay.len(), 3);
        assert_eq!(replay[..2], original[..]);
        assert_eq!(replay[2], InputChunk::Tokens(vec![9, 8]));
    }
}
