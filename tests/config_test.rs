//! Integration tests for engine and generation configuration.

use std::io::Write;

use nano_serve::{EngineConfig, Error, GenerationConfig};

#[test]
fn test_engine_config_defaults() {
    let config = EngineConfig::default();
    assert_eq!(config.max_num_seqs, 256);
    assert_eq!(config.max_single_sequence_length, 4096);
    assert_eq!(config.block_size, 16);
    config.validate().unwrap();
}

#[test]
fn test_engine_config_partial_json() {
    let config = EngineConfig::from_json_str(r#"{"max_num_seqs": 4, "num_blocks": 32}"#).unwrap();
    assert_eq!(config.max_num_seqs, 4);
    assert_eq!(config.num_blocks, 32);
    assert_eq!(config.max_sequence_ids, 1024);
}

#[test]
fn test_engine_config_rejects_invalid() {
    let result = EngineConfig::from_json_str(r#"{"max_num_seqs": 0}"#);
    assert!(matches!(result, Err(Error::Config(_))));

    let result = EngineConfig::from_json_str(r#"{"max_num_seqs": 8, "max_sequence_ids": 4}"#);
    assert!(matches!(result, Err(Error::Config(_))));

    let result = EngineConfig::from_json_str("{not json");
    assert!(matches!(result, Err(Error::Json(_))));
}

#[test]
fn test_engine_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"block_size": 8, "max_single_sequence_length": 128}}"#).unwrap();

    let config = EngineConfig::from_json_file(file.path()).unwrap();
    assert_eq!(config.block_size, 8);
    assert_eq!(config.max_single_sequence_length, 128);

    let missing = EngineConfig::from_json_file(file.path().with_extension("missing"));
    assert!(matches!(missing, Err(Error::Io(_))));
}

#[test]
fn test_generation_config_builders() {
    let config = GenerationConfig::default()
        .max_tokens(12)
        .stop_token(7)
        .stop_str("END")
        .logprobs(3)
        .ignore_eos(true);

    assert_eq!(config.max_tokens, 12);
    assert_eq!(config.stop_token_ids, vec![7]);
    assert_eq!(config.stop_strs, vec!["END".to_string()]);
    assert_eq!(config.logprobs, 3);
    assert!(config.ignore_eos);
}

#[test]
fn test_generation_config_json_defaults() {
    let config: GenerationConfig = serde_json::from_str(r#"{"max_tokens": 5}"#).unwrap();
    assert_eq!(config.max_tokens, 5);
    assert_eq!(config.temperature, 1.0);
    assert!(config.stop_strs.is_empty());
}
