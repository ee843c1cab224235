//! A reuse pool mapping elements to the conditions that keep them eligible.
//!
//! Each element owns one [`Condition`]. Callers feed signals to the
//! conditions, either one element at a time or in batches, and evict the
//! elements whose condition no longer holds.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::time::Duration;
use tracing::debug;

/// Decides whether its owner is still eligible for reuse.
pub trait Condition {
    /// The opaque signal this condition reacts to.
    type Signal;

    fn is_reuse_satisfy(&self) -> bool;

    fn is_reuse_unsatisfy(&self) -> bool {
        !self.is_reuse_satisfy()
    }

    fn update(&mut self, signal: &Self::Signal);
}

/// A thread-safe map from elements to their reuse conditions.
pub struct MapReusePool<E, C> {
    entries: Mutex<HashMap<E, C>>,
}

impl<E, C> MapReusePool<E, C>
where
    E: Eq + Hash + Clone,
    C: Condition,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Adds an element, replacing and returning any previous condition.
    pub fn insert(&self, element: E, condition: C) -> Option<C> {
        self.entries.lock().insert(element, condition)
    }

    pub fn remove(&self, element: &E) -> Option<C> {
        self.entries.lock().remove(element)
    }

    pub fn contains(&self, element: &E) -> bool {
        self.entries.lock().contains_key(element)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn elements(&self) -> Vec<E> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Reads an element's condition under the pool lock.
    pub fn inspect<R>(&self, element: &E, read: impl FnOnce(&C) -> R) -> Option<R> {
        self.entries.lock().get(element).map(read)
    }

    /// Applies `signal` to a single element. Returns `false` if it is absent.
    pub fn update(&self, element: &E, signal: &C::Signal) -> bool {
        match self.entries.lock().get_mut(element) {
            Some(condition) => {
                condition.update(signal);
                true
            }
            None => false,
        }
    }

    /// Elements whose condition currently does not hold. Does not mutate the pool.
    pub fn get_unsatisfy_elements(&self) -> HashSet<E> {
        unsatisfied(&*self.entries.lock())
    }

    /// Removes and returns every element whose condition does not hold.
    pub fn remove_unsatisfy_elements(&self) -> HashSet<E> {
        evict(&mut *self.entries.lock())
    }

    /// Starts a chain of batch updates.
    ///
    /// The operator holds the pool lock until it is dropped, so every update
    /// in the chain lands before any unsatisfied set is computed.
    pub fn batch_operator(&self) -> BatchOperator<'_, E, C> {
        BatchOperator {
            entries: self.entries.lock(),
            touched: HashSet::new(),
        }
    }
}

impl<E, C> Default for MapReusePool<E, C>
where
    E: Eq + Hash + Clone,
    C: Condition,
{
    fn default() -> Self {
        Self::new()
    }
}

fn unsatisfied<E: Eq + Hash + Clone, C: Condition>(entries: &HashMap<E, C>) -> HashSet<E> {
    entries
        .iter()
        .filter(|(_, condition)| condition.is_reuse_unsatisfy())
        .map(|(element, _)| element.clone())
        .collect()
}

fn evict<E: Eq + Hash + Clone, C: Condition>(entries: &mut HashMap<E, C>) -> HashSet<E> {
    let removed = unsatisfied(entries);
    for element in &removed {
        entries.remove(element);
    }
    if !removed.is_empty() {
        debug!(
            removed = removed.len(),
            remaining = entries.len(),
            "Evicted unsatisfied elements."
        );
    }
    removed
}

/// Applies signals to subsets of a [`MapReusePool`] under a single lock.
///
/// The operator remembers which elements it has touched so that
/// [`BatchOperator::update_remain`] reaches only the rest.
pub struct BatchOperator<'a, E, C> {
    entries: MutexGuard<'a, HashMap<E, C>>,
    touched: HashSet<E>,
}

impl<E, C> BatchOperator<'_, E, C>
where
    E: Eq + Hash + Clone,
    C: Condition,
{
    /// Applies `signal` to one element. Absent elements are ignored.
    pub fn update(&mut self, element: &E, signal: &C::Signal) -> &mut Self {
        if let Some(condition) = self.entries.get_mut(element) {
            condition.update(signal);
            self.touched.insert(element.clone());
        }
        self
    }

    /// Applies `signal` to every listed element.
    pub fn update_all<'e>(
        &mut self,
        elements: impl IntoIterator<Item = &'e E>,
        signal: &C::Signal,
    ) -> &mut Self
    where
        E: 'e,
    {
        for element in elements {
            self.update(element, signal);
        }
        self
    }

    /// Applies `signal` to every element accepted by `predicate`.
    pub fn update_matching(
        &mut self,
        mut predicate: impl FnMut(&E, &C) -> bool,
        signal: &C::Signal,
    ) -> &mut Self {
        for (element, condition) in self.entries.iter_mut() {
            if predicate(element, condition) {
                condition.update(signal);
                self.touched.insert(element.clone());
            }
        }
        self
    }

    /// Applies `signal` to every element not yet touched by this operator.
    pub fn update_remain(&mut self, signal: &C::Signal) -> &mut Self {
        for (element, condition) in self.entries.iter_mut() {
            if self.touched.insert(element.clone()) {
                condition.update(signal);
            }
        }
        self
    }

    /// Elements touched so far in this chain.
    pub fn touched(&self) -> &HashSet<E> {
        &self.touched
    }

    pub fn get_unsatisfy_elements(&self) -> HashSet<E> {
        unsatisfied(&*self.entries)
    }

    pub fn remove_unsatisfy_elements(&mut self) -> HashSet<E> {
        let removed = evict(&mut *self.entries);
        self.touched.retain(|element| !removed.contains(element));
        removed
    }
}

/// Signals understood by [`CountCondition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountSignal {
    Increase,
    Reset,
}

/// Holds until a counter reaches its aim-count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountCondition {
    count: u32,
    aim: u32,
}

impl CountCondition {
    pub fn new(aim: u32) -> Self {
        Self { count: 0, aim }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn aim(&self) -> u32 {
        self.aim
    }
}

impl Condition for CountCondition {
    type Signal = CountSignal;

    fn is_reuse_satisfy(&self) -> bool {
        self.count < self.aim
    }

    fn update(&mut self, signal: &CountSignal) {
        match signal {
            CountSignal::Increase => self.count = self.count.saturating_add(1),
            CountSignal::Reset => self.count = 0,
        }
    }
}

/// Signals understood by [`IdleCondition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleSignal {
    /// The element was used at the given instant.
    Touch(DateTime<Utc>),
    /// Re-evaluate idleness as of the given instant.
    Check(DateTime<Utc>),
}

/// Holds while an element has been used within `max_idle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleCondition {
    last_used: DateTime<Utc>,
    checked_at: DateTime<Utc>,
    max_idle: Duration,
}

impl IdleCondition {
    pub fn new(used_at: DateTime<Utc>, max_idle: Duration) -> Self {
        Self {
            last_used: used_at,
            checked_at: used_at,
            max_idle,
        }
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        self.last_used
    }
}

impl Condition for IdleCondition {
    type Signal = IdleSignal;

    fn is_reuse_satisfy(&self) -> bool {
        (self.checked_at - self.last_used)
            .to_std()
            .map_or(true, |idle| idle <= self.max_idle)
    }

    fn update(&mut self, signal: &IdleSignal) {
        match *signal {
            IdleSignal::Touch(at) => {
                self.last_used = self.last_used.max(at);
                self.checked_at = self.checked_at.max(at);
            }
            IdleSignal::Check(at) => self.checked_at = self.checked_at.max(at),
        }
    }
}
