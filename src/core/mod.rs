//! Core data structures for nano-serve.
//!
//! This module contains the fundamental building blocks:
//! - Input chunks and sequence ids
//! - Request and per-model request state
//! - Block tables and the block manager behind the paged KV model

pub mod block;
pub mod block_manager;
pub mod data;
pub mod request;
pub mod sequence_id;
