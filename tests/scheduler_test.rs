//! Integration tests for EngineState: admission, commit accounting, abort.

use nano_serve::model::Model;
use nano_serve::{
    EngineState, Error, GenerationConfig, InputChunk, PagedKvModel, Request, SampleResult,
};

fn test_models(n: usize) -> Vec<Box<dyn Model>> {
    (0..n)
        .map(|i| {
            Box::new(PagedKvModel::new(
                format!("m{i}"),
                64,
                4,
                Box::new(|_: &[u32]| SampleResult::new(42, -0.1)),
            )) as Box<dyn Model>
        })
        .collect()
}

fn add(estate: &mut EngineState, id: &str, prompt_len: usize) {
    let request = Request::from_tokens(id, vec![7; prompt_len], GenerationConfig::default());
    estate.add_request(request).unwrap();
}

/// Admit everything waiting and play the prefill: consume inputs and commit
/// the first token on every replica.
fn admit_and_prefill(estate: &mut EngineState, models: &mut [Box<dyn Model>]) -> Vec<String> {
    let admitted = estate.admit_waiting(models, 16, |_, _| true).unwrap();
    for id in &admitted {
        for i in 0..models.len() {
            estate.get_request_state_mut(id).unwrap().mstates_mut()[i].take_inputs();
            estate.commit_token(id, i, SampleResult::new(1, -0.5)).unwrap();
        }
        estate.mark_prefill_finished(id).unwrap();
    }
    admitted
}

#[test]
fn test_state_creation() {
    let estate = EngineState::new(2, 8);
    assert_eq!(estate.num_models(), 2);
    assert_eq!(estate.num_running(), 0);
    assert_eq!(estate.num_waiting(), 0);
    assert!(!estate.has_pending_requests());
    assert_eq!(estate.stats().current_total_seq_len, 0);
    estate.check_invariants().unwrap();
}

#[test]
fn test_add_request_goes_to_waiting_back() {
    let mut estate = EngineState::new(1, 8);
    add(&mut estate, "a", 3);
    add(&mut estate, "b", 3);

    assert_eq!(estate.waiting_queue().iter().collect::<Vec<_>>(), ["a", "b"]);
    assert!(estate.has_pending_requests());
    estate.check_invariants().unwrap();
}

#[test]
fn test_duplicate_and_empty_requests_rejected() {
    let mut estate = EngineState::new(1, 8);
    add(&mut estate, "a", 3);

    let dup = Request::from_tokens("a", vec![1], GenerationConfig::default());
    assert!(matches!(estate.add_request(dup), Err(Error::DuplicateRequest(_))));

    let empty = Request::new("e", vec![], GenerationConfig::default());
    assert!(matches!(estate.add_request(empty), Err(Error::Tokenization(_))));
    assert_eq!(estate.num_requests(), 1);
}

#[test]
fn test_admission_respects_order_and_limit() {
    let mut estate = EngineState::new(1, 8);
    let mut models = test_models(1);
    for id in ["a", "b", "c"] {
        add(&mut estate, id, 4);
    }

    let admitted = estate.admit_waiting(&mut models, 2, |_, _| true).unwrap();
    assert_eq!(admitted, ["a", "b"]);
    assert_eq!(estate.running_queue().iter().collect::<Vec<_>>(), ["a", "b"]);
    assert_eq!(estate.waiting_queue().iter().collect::<Vec<_>>(), ["c"]);
    assert_eq!(estate.num_live_sequence_ids(), 2);
    // No token committed yet: each occupies its prompt.
    assert_eq!(estate.stats().current_total_seq_len, 8);
}

#[test]
fn test_admission_stops_at_rejected_request() {
    let mut estate = EngineState::new(1, 8);
    let mut models = test_models(1);
    add(&mut estate, "small", 2);
    add(&mut estate, "large", 50);
    add(&mut estate, "small2", 2);

    let admitted = estate
        .admit_waiting(&mut models, 8, |state, _| state.request().input_total_length() < 10)
        .unwrap();
    assert_eq!(admitted, ["small"]);
    assert_eq!(estate.waiting_queue().front().map(String::as_str), Some("large"));
}

#[test]
fn test_admission_registers_sequence_in_every_model() {
    let mut estate = EngineState::new(2, 8);
    let mut models = test_models(2);
    add(&mut estate, "a", 4);

    estate.admit_waiting(&mut models, 4, |_, _| true).unwrap();
    let state = estate.get_request_state("a").unwrap();
    let seq_id = state.primary().internal_id().unwrap();
    assert!(state.mstates().iter().all(|m| m.internal_id() == Some(seq_id)));

    // Registering the same id again must fail in every model.
    for model in models.iter_mut() {
        assert!(matches!(model.add_sequence(seq_id), Err(Error::SequenceExists(_))));
    }
}

#[test]
fn test_commit_token_accounting() {
    let mut estate = EngineState::new(2, 8);
    let mut models = test_models(2);
    add(&mut estate, "a", 10);
    admit_and_prefill(&mut estate, &mut models);

    // First token is not in the KV cache yet.
    assert_eq!(estate.stats().current_total_seq_len, 10);

    estate.commit_token("a", 0, SampleResult::new(2, -0.1)).unwrap();
    assert_eq!(estate.stats().current_total_seq_len, 11);
    // Secondary replicas do not move the occupied length.
    estate.commit_token("a", 1, SampleResult::new(2, -0.1)).unwrap();
    assert_eq!(estate.stats().current_total_seq_len, 11);

    estate.check_invariants().unwrap();
}

#[test]
fn test_commit_token_requires_running_request() {
    let mut estate = EngineState::new(1, 8);
    add(&mut estate, "a", 3);

    let result = estate.commit_token("a", 0, SampleResult::new(1, 0.0));
    assert!(matches!(result, Err(Error::NotRunning(_))));

    let result = estate.commit_token("ghost", 0, SampleResult::new(1, 0.0));
    assert!(matches!(result, Err(Error::NotRunning(_))));
}

#[test]
fn test_mark_prefill_finished_is_sticky() {
    let mut estate = EngineState::new(1, 8);
    let mut models = test_models(1);
    add(&mut estate, "a", 3);
    admit_and_prefill(&mut estate, &mut models);

    let first = estate.get_request_state("a").unwrap().tprefill_finish().unwrap();
    estate.mark_prefill_finished("a").unwrap();
    let second = estate.get_request_state("a").unwrap().tprefill_finish().unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_abort_waiting_request_removes_it() {
    let mut estate = EngineState::new(1, 8);
    add(&mut estate, "a", 3);
    add(&mut estate, "b", 3);

    estate.abort_request("a").unwrap();
    assert_eq!(estate.waiting_queue().iter().collect::<Vec<_>>(), ["b"]);
    assert!(matches!(estate.get_request_state("a"), Err(Error::RequestNotFound(_))));
    assert!(matches!(estate.abort_request("a"), Err(Error::RequestNotFound(_))));
    estate.check_invariants().unwrap();
}

#[test]
fn test_abort_running_request_is_deferred() {
    let mut estate = EngineState::new(1, 8);
    let mut models = test_models(1);
    add(&mut estate, "a", 3);
    admit_and_prefill(&mut estate, &mut models);

    estate.abort_request("a").unwrap();
    // Still running until the next post-step pass reclaims it.
    assert_eq!(estate.num_running(), 1);
    assert!(estate.get_request_state("a").unwrap().finish_reason().is_none());
}

#[test]
fn test_invariants_catch_pending_inputs_on_running_request() {
    let mut estate = EngineState::new(1, 8);
    let mut models = test_models(1);
    add(&mut estate, "a", 3);
    estate.admit_waiting(&mut models, 4, |_, _| true).unwrap();

    // Admitted but not prefilled: inputs are still pending.
    assert!(matches!(estate.check_invariants(), Err(Error::Consistency(_))));

    estate.get_request_state_mut("a").unwrap().mstates_mut()[0].take_inputs();
    estate.commit_token("a", 0, SampleResult::new(1, 0.0)).unwrap();
    estate.check_invariants().unwrap();
}

#[test]
fn test_invariants_catch_drafts_on_waiting_request() {
    let mut estate = EngineState::new(1, 8);
    add(&mut estate, "a", 3);
    estate.get_request_state_mut("a").unwrap().mstates_mut()[0]
        .add_draft_token(SampleResult::new(3, 0.0));

    assert!(matches!(estate.check_invariants(), Err(Error::Consistency(_))));
}

#[test]
fn test_waiting_inputs_survive_admission_rejection() {
    let mut estate = EngineState::new(1, 8);
    let mut models = test_models(1);
    add(&mut estate, "a", 3);

    let admitted = estate.admit_waiting(&mut models, 4, |_, _| false).unwrap();
    assert!(admitted.is_empty());
    let state = estate.get_request_state("a").unwrap();
    assert_eq!(state.primary().inputs(), &[InputChunk::Tokens(vec![7; 3])]);
    assert!(state.primary().internal_id().is_none());
    assert_eq!(estate.num_live_sequence_ids(), 0);
}
