use crate::{error::Error, FencingToken, Result};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FencingRecord {
    pub key: String,
    pub last_accepted_token: FencingToken,
}

/// Guards a resource against writes from holders whose lease has moved on.
///
/// Tokens for a key are accepted in non-decreasing order. A token equal to
/// the last accepted one passes, so one holder can issue several operations
/// under a single lease. Anything lower fails with [`Error::StaleToken`].
#[derive(Debug, Default)]
pub struct FencingValidator {
    accepted: DashMap<String, FencingToken>,
}

impl FencingValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Would `token` be accepted right now? Does not record anything.
    pub fn check(&self, key: &str, token: FencingToken) -> Result<()> {
        match self.accepted.get(key) {
            Some(last) if token < *last => Err(stale(key, token, *last)),
            _ => Ok(()),
        }
    }

    /// Records `token` as the newest seen for `key`, unless it is stale.
    pub fn accept(&self, key: &str, token: FencingToken) -> Result<()> {
        self.apply(key, token, || ())
    }

    /// Runs `effect` only if `token` is current, with the check and the
    /// high-water-mark update done under the key's lock. Two holders racing on
    /// the same key are serialized here, so a stale one can never slip its
    /// effect in after a newer token was recorded.
    pub fn apply<T>(
        &self,
        key: &str,
        token: FencingToken,
        effect: impl FnOnce() -> T,
    ) -> Result<T> {
        match self.accepted.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                let last = *slot.get();
                if token < last {
                    warn!(key, %token, %last, "rejecting stale token");
                    return Err(stale(key, token, last));
                }
                let output = effect();
                if token > last {
                    debug!(key, %token, "advanced fencing token");
                    slot.insert(token);
                }
                Ok(output)
            }
            Entry::Vacant(slot) => {
                let output = effect();
                slot.insert(token);
                Ok(output)
            }
        }
    }

    pub fn record(&self, key: &str) -> Option<FencingRecord> {
        self.accepted.get(key).map(|last| FencingRecord {
            key: key.to_string(),
            last_accepted_token: *last,
        })
    }

    pub fn last_accepted(&self, key: &str) -> Option<FencingToken> {
        self.accepted.get(key).map(|last| *last)
    }
}

fn stale(key: &str, presented: FencingToken, last_accepted: FencingToken) -> Error {
    Error::StaleToken {
        key: key.to_string(),
        presented,
        last_accepted,
    }
}
