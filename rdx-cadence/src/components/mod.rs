//! Contains the building blocks the engine is made of.
//!
//! This module provides the units of work (one-shot tasks and recurring
//! plans), the observer contracts used to follow them, and the reuse pool.
//! The `ListTimer` drives collections of plans built from these components.

pub mod observer;
pub mod plan;
pub mod pool;
pub mod task;
