//! Storage backends for the consensus log, hard state and committed topology.

pub mod memory;

pub use memory::MemoryStorage;
