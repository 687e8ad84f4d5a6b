//! Reclamation of finished requests.

use std::time::Instant;

use crate::core::request::RequestId;
use crate::error::{Error, Result};
use crate::model::{remove_sequence_from_models, Model};
use crate::scheduler::state::EngineState;

/// Remove finished requests from the engine, in order.
///
/// For each request: drop it from the running queue, release its primary
/// sequence id from every model and recycle the id, drop its state, and fold
/// its lengths and timings into the statistics.
///
/// # Errors
///
/// A request missing from the running queue (including one already
/// reclaimed) or a sequence id that is not live is a fatal consistency error.
pub fn reclaim_finished(
    finished: &[RequestId],
    estate: &mut EngineState,
    models: &mut [Box<dyn Model>],
) -> Result<()> {
    for id in finished {
        let pos = estate
            .running_queue
            .iter()
            .position(|r| r == id)
            .ok_or_else(|| {
                tracing::error!(request_id = %id, "finished request is not in the running queue");
                Error::NotRunning(id.clone())
            })?;
        let seq_id = estate
            .get_request_state(id)?
            .primary()
            .internal_id()
            .ok_or_else(|| Error::consistency(format!("running request {id} has no sequence id")))?;

        estate.running_queue.remove(pos);
        remove_sequence_from_models(models, seq_id)?;
        let state = estate
            .request_states
            .remove(id)
            .ok_or_else(|| Error::RequestNotFound(id.clone()))?;
        estate.recycle_sequence_id(seq_id)?;

        let num_input_tokens = state.request().input_total_length();
        let num_output_tokens = state.primary().committed_tokens().len().saturating_sub(1);
        estate.stats.release_seq_len(state.occupied_len())?;

        // TODO: stamp a per-request finish time at detection so deferred
        // reclamation does not inflate decode time.
        let now = Instant::now();
        let tadd = state.request().tadd;
        let tprefill_finish = state.tprefill_finish().unwrap_or(now);
        let prefill_secs = tprefill_finish.saturating_duration_since(tadd).as_secs_f64();
        let decode_secs = now.saturating_duration_since(tprefill_finish).as_secs_f64();

        let stats = &mut estate.stats;
        stats.request_total_prefill_time += prefill_secs;
        stats.total_prefill_length += num_input_tokens;
        stats.request_total_decode_time += decode_secs;
        stats.total_decode_length += num_output_tokens;

        tracing::debug!(
            request_id = %id,
            sequence_id = seq_id,
            finish_reason = state.finish_reason().map(|r| r.as_str()),
            num_input_tokens,
            num_output_tokens,
            prefill_secs,
            decode_secs,
            "request reclaimed"
        );
    }
    Ok(())
}
