//! Contains common, primitive types shared across the engine.
//!
//! This module defines the key type used to identify registrations inside a
//! `ListTimer`, and the boxed closure types that make up the bodies of tasks
//! and plans.

use slotmap::new_key_type;

new_key_type! {
    /// Uniquely and safely identifies a plan registration within a `ListTimer`.
    ///
    /// A key is handed out when a plan is scheduled and is never reused, so a
    /// plan that is removed and scheduled again receives a fresh key.
    pub struct PlanKey;
}

/// The body of a one-shot `Task`. It is consumed by the single run.
pub type TaskBody = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// The body of a recurring `Plan`. It is invoked once per run.
pub type PlanBody = Box<dyn FnMut() -> anyhow::Result<()> + Send>;
