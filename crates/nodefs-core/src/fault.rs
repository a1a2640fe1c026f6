// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fault injection policy + runtime controller for vnode construction

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::ConstructError;

/// Failure a rule injects into the constructor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Host ran out of vnodes
    Exhausted,
    Eio,
    Enfile,
}

impl FaultKind {
    fn to_error(self) -> ConstructError {
        match self {
            FaultKind::Exhausted => ConstructError::ResourceExhausted,
            FaultKind::Eio => ConstructError::Errno(libc::EIO),
            FaultKind::Enfile => ConstructError::Errno(libc::ENFILE),
        }
    }
}

/// Individual rule describing how often construction should fail.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FaultRule {
    pub kind: FaultKind,
    /// Only fail constructions for this node id
    #[serde(default)]
    pub identifier: Option<u64>,
    /// Number of matching invocations to let through before injecting faults.
    #[serde(default)]
    pub start_after: u64,
    /// Maximum number of injected failures for this rule.
    #[serde(default)]
    pub max_faults: Option<u64>,
}

impl Default for FaultRule {
    fn default() -> Self {
        Self {
            kind: FaultKind::Exhausted,
            identifier: None,
            start_after: 0,
            max_faults: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct FaultPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<FaultRule>,
}

impl FaultPolicy {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Clone, Debug, Default)]
struct RuleTally {
    /// Matching constructions seen by the rule
    seen: u64,
    /// Failures the rule has produced
    fired: u64,
}

#[derive(Clone, Debug, Default)]
struct InjectorState {
    policy: FaultPolicy,
    tallies: Vec<RuleTally>,
}

/// Shared switchboard consulted by a vnode factory before every construction
#[derive(Default)]
pub struct FaultInjector {
    state: Mutex<InjectorState>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_policy(&self, policy: FaultPolicy) {
        let mut state = self.lock();
        state.tallies = vec![RuleTally::default(); policy.rules.len()];
        state.policy = policy;
    }

    /// Drop every rule and reset the tallies
    pub fn clear(&self) {
        *self.lock() = InjectorState::default();
    }

    fn lock(&self) -> MutexGuard<'_, InjectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Total faults injected so far
    pub fn hits(&self) -> u64 {
        self.lock().tallies.iter().map(|tally| tally.fired).sum()
    }

    /// Decide whether the construction of `identifier` should fail
    pub fn should_fault(&self, identifier: u64) -> Option<ConstructError> {
        let mut state = self.lock();
        let InjectorState { policy, tallies } = &mut *state;
        if !policy.enabled {
            return None;
        }
        tallies.resize(policy.rules.len(), RuleTally::default());
        policy
            .rules
            .iter()
            .zip(tallies.iter_mut())
            .filter(|(rule, _)| rule.identifier.map_or(true, |id| id == identifier))
            .find_map(|(rule, tally)| {
                tally.seen += 1;
                let armed = tally.seen > rule.start_after;
                let spent = rule.max_faults.is_some_and(|max| tally.fired >= max);
                if !armed || spent {
                    return None;
                }
                tally.fired += 1;
                Some(rule.kind.to_error())
            })
    }
}
