//! State cache
//!
//! The only place where lookup expressions meet the outside world. Each
//! [`State`] has one [`CacheEntry`] holding the last known value, the cycle
//! it was last refreshed in, and the lookups currently registered on it.
//!
//! Refreshes are deduplicated per quiescence cycle: however many lookups ask
//! for a state in one cycle, the [`LookupHandler`] is asked once. Values
//! pushed in from the input queue reach each change lookup only when they
//! moved by at least that lookup's tolerance since its last delivery.

use std::collections::HashMap;
use tracing::{debug, trace};

use crate::engine::expr::{ExprGraph, ExprId};
use crate::engine::interface::{LookupHandler, State};
use crate::engine::value::Value;
use crate::error::{ExecError, ExecResult};

/// One lookup registered on a state
#[derive(Debug, Clone)]
struct Registration {
    expr: ExprId,
    /// `None` for a one-shot lookup
    tolerance: Option<f64>,
    /// Last value delivered to this lookup
    previous: Value,
}

impl Registration {
    fn is_change_lookup(&self) -> bool {
        self.tolerance.is_some()
    }

    fn wants(&self, value: &Value) -> bool {
        let tolerance = match self.tolerance {
            Some(tolerance) => tolerance,
            None => return false,
        };
        let delta = self.previous.difference(value);
        delta > 0.0 && delta >= tolerance
    }
}

/// Per-state record
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    value: Value,
    refreshed_cycle: Option<u64>,
    registrations: Vec<Registration>,
    thresholds: Option<(f64, f64)>,
}

impl CacheEntry {
    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn refreshed_cycle(&self) -> Option<u64> {
        self.refreshed_cycle
    }

    /// Current (hi, lo) thresholds pushed to the handler
    pub fn thresholds(&self) -> Option<(f64, f64)> {
        self.thresholds
    }

    pub fn change_lookup_count(&self) -> usize {
        self.registrations
            .iter()
            .filter(|r| r.is_change_lookup())
            .count()
    }

    /// Tightest band around the delivered values: min hi, max lo
    fn compute_thresholds(&self) -> Option<(f64, f64)> {
        let mut band: Option<(f64, f64)> = None;
        for reg in &self.registrations {
            let (tolerance, previous) = match (reg.tolerance, reg.previous.as_real()) {
                (Some(t), Some(p)) if t > 0.0 => (t, p),
                _ => continue,
            };
            let (hi, lo) = (previous + tolerance, previous - tolerance);
            band = Some(match band {
                Some((h, l)) => (h.min(hi), l.max(lo)),
                None => (hi, lo),
            });
        }
        band
    }
}

/// Cache of external state values keyed by [`State`]
#[derive(Debug)]
pub struct StateCache {
    entries: HashMap<State, CacheEntry>,
    by_expr: HashMap<ExprId, State>,
    cycle: u64,
    time_state: State,
    current_time: Option<f64>,
}

impl StateCache {
    /// Create a cache whose clock is read from `time_state`
    pub fn new(time_state: State) -> Self {
        Self {
            entries: HashMap::new(),
            by_expr: HashMap::new(),
            cycle: 0,
            time_state,
            current_time: None,
        }
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn time_state(&self) -> &State {
        &self.time_state
    }

    pub fn entry(&self, state: &State) -> Option<&CacheEntry> {
        self.entries.get(state)
    }

    /// Last known value of `state`, without refreshing
    pub fn cached_value(&self, state: &State) -> Option<&Value> {
        self.entries.get(state).map(|e| &e.value)
    }

    /// State a lookup expression is currently registered on
    pub fn registered_state(&self, expr: ExprId) -> Option<&State> {
        self.by_expr.get(&expr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start a new quiescence cycle; refreshes become due again.
    pub fn begin_cycle(&mut self) -> u64 {
        self.cycle += 1;
        trace!(cycle = self.cycle, "state cache cycle");
        self.cycle
    }

    /// Time as of the last refresh of the clock state
    pub fn current_time(&self) -> Option<f64> {
        self.current_time
    }

    /// Read the clock through the handler, at most once per cycle.
    ///
    /// A clock that runs backwards is an internal error.
    pub fn refresh_time(
        &mut self,
        graph: &mut ExprGraph,
        handler: &dyn LookupHandler,
    ) -> ExecResult<Option<f64>> {
        let state = self.time_state.clone();
        let fresh = self
            .entries
            .get(&state)
            .map_or(false, |e| e.refreshed_cycle == Some(self.cycle));
        if !fresh {
            let value = handler.lookup_now(&state);
            self.entries.entry(state.clone()).or_default();
            self.apply(graph, &state, value)?;
        }
        Ok(self.current_time)
    }

    /// Next time at which a change lookup on the clock wants a value
    pub fn next_time_threshold(&self) -> Option<f64> {
        self.entries
            .get(&self.time_state)
            .and_then(|e| e.thresholds)
            .map(|(hi, _)| hi)
    }

    /// Register a lookup expression on `state` and give it a value.
    ///
    /// `tolerance` of `None` registers a one-shot lookup; `Some(t)` a change
    /// lookup. The first change lookup on a state subscribes with the
    /// handler.
    pub fn register_lookup(
        &mut self,
        graph: &mut ExprGraph,
        handler: &dyn LookupHandler,
        expr: ExprId,
        state: State,
        tolerance: Option<f64>,
    ) -> ExecResult<()> {
        if self.by_expr.contains_key(&expr) {
            return Err(ExecError::Internal(format!(
                "lookup {:?} registered twice",
                expr
            )));
        }
        let cycle = self.cycle;
        let entry = self.entries.entry(state.clone()).or_default();
        if tolerance.is_some() && entry.change_lookup_count() == 0 {
            debug!(state = %state, "subscribing");
            handler.subscribe(&state);
        }
        if entry.refreshed_cycle != Some(cycle) {
            trace!(state = %state, cycle, "refreshing state");
            let value = handler.lookup_now(&state);
            self.apply(graph, &state, value)?;
        }

        let entry = match self.entries.get_mut(&state) {
            Some(entry) => entry,
            None => return Err(ExecError::Internal(format!("cache entry for {} vanished", state))),
        };
        let value = entry.value.clone();
        entry.registrations.push(Registration {
            expr,
            tolerance,
            previous: value.clone(),
        });
        self.by_expr.insert(expr, state.clone());
        graph.set_value(expr, value)?;
        self.push_thresholds(handler, &state);
        Ok(())
    }

    /// Drop a lookup. The last change lookup unsubscribes; the cached value
    /// stays for later one-shot lookups.
    pub fn unregister_lookup(
        &mut self,
        handler: &dyn LookupHandler,
        expr: ExprId,
    ) -> ExecResult<()> {
        let state = match self.by_expr.remove(&expr) {
            Some(state) => state,
            // already gone, e.g. torn down after the entry was released
            None => return Ok(()),
        };
        let entry = match self.entries.get_mut(&state) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        let was_subscribed = entry.change_lookup_count() > 0;
        entry.registrations.retain(|r| r.expr != expr);
        if was_subscribed && entry.change_lookup_count() == 0 {
            debug!(state = %state, "unsubscribing");
            entry.thresholds = None;
            handler.unsubscribe(&state);
        } else {
            self.push_thresholds(handler, &state);
        }
        Ok(())
    }

    /// Apply a value arriving from the input queue.
    ///
    /// Values for states nobody ever looked up are dropped.
    pub fn update_state(
        &mut self,
        graph: &mut ExprGraph,
        handler: &dyn LookupHandler,
        state: &State,
        value: Value,
    ) -> ExecResult<()> {
        if !self.entries.contains_key(state) {
            trace!(state = %state, "ignoring value for unregistered state");
            return Ok(());
        }
        self.apply(graph, state, value)?;
        self.push_thresholds(handler, state);
        Ok(())
    }

    fn apply(&mut self, graph: &mut ExprGraph, state: &State, value: Value) -> ExecResult<()> {
        if *state == self.time_state {
            if let Some(now) = value.as_real() {
                if let Some(previous) = self.current_time {
                    if now < previous {
                        return Err(ExecError::TimeRegressed {
                            previous,
                            current: now,
                        });
                    }
                }
                self.current_time = Some(now);
            }
        }

        let cycle = self.cycle;
        let entry = match self.entries.get_mut(state) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        entry.value = value.clone();
        entry.refreshed_cycle = Some(cycle);

        let mut deliveries = Vec::new();
        for reg in entry.registrations.iter_mut() {
            if reg.wants(&value) {
                reg.previous = value.clone();
                deliveries.push(reg.expr);
            }
        }
        for expr in deliveries {
            trace!(state = %state, expr = ?expr, value = %value, "delivering state change");
            graph.set_value(expr, value.clone())?;
        }
        Ok(())
    }

    fn push_thresholds(&mut self, handler: &dyn LookupHandler, state: &State) {
        let entry = match self.entries.get_mut(state) {
            Some(entry) => entry,
            None => return,
        };
        let band = entry.compute_thresholds();
        if band != entry.thresholds {
            entry.thresholds = band;
            if let Some((hi, lo)) = band {
                handler.set_thresholds(state, hi, lo);
            }
        }
    }

    /// Forget every registration, keeping values. Used at teardown.
    pub fn clear_registrations(&mut self, handler: &dyn LookupHandler) {
        for (state, entry) in self.entries.iter_mut() {
            if entry.change_lookup_count() > 0 {
                handler.unsubscribe(state);
            }
            entry.registrations.clear();
            entry.thresholds = None;
        }
        self.by_expr.clear();
    }
}
