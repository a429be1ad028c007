//! Read-after-write consistency policy.
//!
//! With `enforce_consistency = "always"` the proxy merges every
//! `X-Vault-Index` state returned by the upstream and attaches the merged
//! states to every later request, so a performance standby that has not caught up answers
//! 412 instead of serving stale data. `when_inconsistent` decides what
//! happens next.

use arc_swap::ArcSwap;
use axum::http::{HeaderMap, HeaderValue};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::cmp::Ordering;
use std::str::FromStr;
use thiserror::Error;

use crate::config::ApiProxyConfig;

pub const HEADER_INDEX: &str = "x-vault-index";
pub const HEADER_INCONSISTENT: &str = "x-vault-inconsistent";
pub const FORWARD_ACTIVE_NODE: &str = "forward-active-node";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("unknown enforce_consistency value {0:?}, expected \"always\" or \"never\"")]
    Enforce(String),

    #[error("unknown when_inconsistent value {0:?}, expected \"fail\", \"retry\" or \"forward\"")]
    WhenInconsistent(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnforceConsistency {
    #[default]
    Never,
    Always,
}

impl FromStr for EnforceConsistency {
    type Err = ConsistencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "never" => Ok(Self::Never),
            "always" => Ok(Self::Always),
            _ => Err(ConsistencyError::Enforce(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WhenInconsistent {
    #[default]
    Fail,
    Retry,
    Forward,
}

impl FromStr for WhenInconsistent {
    type Err = ConsistencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "fail" => Ok(Self::Fail),
            "retry" => Ok(Self::Retry),
            "forward" => Ok(Self::Forward),
            _ => Err(ConsistencyError::WhenInconsistent(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsistencyPolicy {
    pub enforce: EnforceConsistency,
    pub when_inconsistent: WhenInconsistent,
}

impl ConsistencyPolicy {
    pub fn from_config(config: Option<&ApiProxyConfig>) -> Result<Self, ConsistencyError> {
        let Some(config) = config else {
            return Ok(Self::default());
        };
        Ok(Self {
            enforce: config.enforce_consistency.parse()?,
            when_inconsistent: config.when_inconsistent.parse()?,
        })
    }

    pub fn enforced(&self) -> bool {
        self.enforce == EnforceConsistency::Always
    }
}

/// A decoded `X-Vault-Index` value: `v1:<cluster>:<local>:<replicated>:<hmac>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationState {
    pub cluster_id: String,
    pub local_index: u64,
    pub replicated_index: u64,
}

impl ReplicationState {
    /// Decode a base64 header value. `None` for anything malformed.
    pub fn parse(encoded: &str) -> Option<Self> {
        let raw = BASE64.decode(encoded.trim()).ok()?;
        let raw = String::from_utf8(raw).ok()?;
        let pieces: Vec<&str> = raw.split(':').collect();
        if pieces.len() != 5 || pieces[0] != "v1" {
            return None;
        }
        Some(Self {
            cluster_id: pieces[1].to_string(),
            local_index: pieces[2].parse().ok()?,
            replicated_index: pieces[3].parse().ok()?,
        })
    }

    /// `Greater` when `self` has seen everything `other` has, `Less` for the
    /// reverse, `None` when each is ahead on one index or the clusters differ.
    fn dominance(&self, other: &Self) -> Option<Ordering> {
        if self.cluster_id != other.cluster_id {
            return None;
        }
        if self.local_index >= other.local_index && self.replicated_index >= other.replicated_index {
            Some(Ordering::Greater)
        } else if self.local_index <= other.local_index
            && self.replicated_index <= other.replicated_index
        {
            Some(Ordering::Less)
        } else {
            None
        }
    }
}

/// Merge `new` into the known states. A state is only replaced by one that
/// dominates it, so the required index never moves backward.
pub fn merge_states(old: &[String], new: &str) -> Vec<String> {
    let Some(incoming) = ReplicationState::parse(new) else {
        return old.to_vec();
    };
    if old.is_empty() || old.len() > 2 {
        return vec![new.to_string()];
    }

    let mut merged = Vec::with_capacity(old.len() + 1);
    for existing in old {
        let Some(state) = ReplicationState::parse(existing) else {
            return vec![new.to_string()];
        };
        if state.cluster_id != incoming.cluster_id {
            return vec![new.to_string()];
        }
        match state.dominance(&incoming) {
            Some(Ordering::Greater) => return vec![existing.clone()],
            Some(Ordering::Less) => {}
            _ => merged.push(existing.clone()),
        }
    }
    merged.push(new.to_string());
    merged.sort();
    merged
}

/// Index states observed from the upstream, merged so they only advance.
#[derive(Debug, Default)]
pub struct IndexTracker {
    states: ArcSwap<Vec<String>>,
}

impl IndexTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge every index state carried by a response.
    pub fn observe(&self, headers: &HeaderMap) {
        for value in headers.get_all(HEADER_INDEX) {
            let Some(value) = value.to_str().ok().filter(|v| !v.is_empty()) else {
                continue;
            };
            self.states.rcu(|states| merge_states(states, value));
        }
    }

    /// States currently required of the upstream.
    pub fn states(&self) -> Vec<String> {
        self.states.load().as_ref().clone()
    }

    /// Decorate an outgoing request according to `policy`.
    pub fn apply(&self, policy: &ConsistencyPolicy, headers: &mut HeaderMap) {
        if !policy.enforced() {
            return;
        }
        headers.remove(HEADER_INDEX);
        for state in self.states.load().iter() {
            if let Ok(value) = HeaderValue::from_str(state) {
                headers.append(HEADER_INDEX, value);
            }
        }
        if policy.when_inconsistent == WhenInconsistent::Forward {
            headers.insert(HEADER_INCONSISTENT, HeaderValue::from_static(FORWARD_ACTIVE_NODE));
        }
    }
}
