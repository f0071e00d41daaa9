//! # sched-store
//!
//! Storage backends for the GPU scheduler.
//!
//! This crate provides [`MemoryRepository`], an in-memory implementation of
//! the [`sched_core::Repository`] contract. It backs the engine's test suite
//! and serves as the reference for the transactional semantics a durable
//! backend must provide: the allocation commit and release composites apply
//! entirely or not at all.

pub mod memory;

pub use memory::{MemoryRepository, StoreStats};
