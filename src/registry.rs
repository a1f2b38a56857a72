//! Known-alias registry.
//!
//! Tracks which aliases are known to exist on the backend so repeated runs
//! skip the existence probe. The registry is an explicitly owned value held
//! by a [`DeploymentCache`](crate::deploy::DeploymentCache); there is no
//! process-wide state.
//!
//! # State Machine
//!
//! ```text
//! Unknown -> Probing -> Deploying  -> Deployed
//!                    \-> ProbeFound -> Deployed
//! ```
//!
//! A failed probe or deploy returns the alias to `Unknown`, as does removal.
//! `Unknown` is never stored: an alias absent from the map is unknown.

use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::alias::Alias;
use crate::error::DeployError;

/// Deployment state of a single alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasState {
    Unknown,
    /// An existence probe is in flight.
    Probing,
    /// The probe missed; a build and publish is in flight.
    Deploying,
    /// The probe found the alias already published.
    ProbeFound,
    /// Usable for dispatch.
    Deployed,
}

impl fmt::Display for AliasState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Probing => write!(f, "probing"),
            Self::Deploying => write!(f, "deploying"),
            Self::ProbeFound => write!(f, "probe_found"),
            Self::Deployed => write!(f, "deployed"),
        }
    }
}

impl AliasState {
    /// Returns `true` if moving from this state to `next` is allowed.
    ///
    /// ```
    /// use flock::registry::AliasState;
    ///
    /// assert!(AliasState::Unknown.can_transition_to(&AliasState::Probing));
    /// assert!(AliasState::Deployed.can_transition_to(&AliasState::Unknown));
    /// assert!(!AliasState::Unknown.can_transition_to(&AliasState::Deployed));
    /// ```
    pub fn can_transition_to(&self, next: &Self) -> bool {
        if self == next {
            return false;
        }

        match self {
            Self::Unknown => matches!(next, Self::Probing),
            Self::Probing => matches!(next, Self::Deploying | Self::ProbeFound | Self::Unknown),
            Self::Deploying | Self::ProbeFound => matches!(next, Self::Deployed | Self::Unknown),
            Self::Deployed => matches!(next, Self::Unknown),
        }
    }

    /// Like [`can_transition_to`](Self::can_transition_to) but returns a
    /// [`DeployError::InvalidTransition`] naming the alias.
    pub fn validate_transition(&self, alias: &Alias, next: &Self) -> Result<(), DeployError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DeployError::InvalidTransition {
                alias: alias.to_string(),
                from: *self,
                to: *next,
            })
        }
    }
}

/// Concurrent map from alias to [`AliasState`].
#[derive(Debug, Default)]
pub struct AliasRegistry {
    states: DashMap<Alias, AliasState>,
}

impl AliasRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state; absent aliases are `Unknown`.
    pub fn state(&self, alias: &Alias) -> AliasState {
        self.states
            .get(alias)
            .map_or(AliasState::Unknown, |entry| *entry.value())
    }

    pub fn is_deployed(&self, alias: &Alias) -> bool {
        self.state(alias) == AliasState::Deployed
    }

    /// Atomically moves `alias` to `next`, validating the transition.
    pub fn transition(&self, alias: &Alias, next: AliasState) -> Result<(), DeployError> {
        let current = self.state(alias);
        match self.states.entry(alias.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                entry.get().validate_transition(alias, &next)?;
                if next == AliasState::Unknown {
                    entry.remove();
                } else {
                    entry.insert(next);
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                AliasState::Unknown.validate_transition(alias, &next)?;
                entry.insert(next);
            }
        }
        tracing::trace!(alias = %alias, from = %current, to = %next, "alias state changed");
        Ok(())
    }

    /// Drops `alias` back to `Unknown` from any state.
    pub fn forget(&self, alias: &Alias) {
        self.states.remove(alias);
    }

    pub fn clear(&self) {
        self.states.clear();
    }

    /// Replaces the whole registry with `aliases`, all marked `Deployed`.
    pub fn replace_all<I>(&self, aliases: I)
    where
        I: IntoIterator<Item = Alias>,
    {
        self.states.clear();
        for alias in aliases {
            self.states.insert(alias, AliasState::Deployed);
        }
    }

    /// Deployed aliases, sorted.
    pub fn deployed(&self) -> Vec<Alias> {
        let mut aliases: Vec<Alias> = self
            .states
            .iter()
            .filter(|entry| *entry.value() == AliasState::Deployed)
            .map(|entry| entry.key().clone())
            .collect();
        aliases.sort();
        aliases
    }

    /// Number of aliases in any state other than `Unknown`.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
