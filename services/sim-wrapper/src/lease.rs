use std::sync::Arc;

use infrared::ProjectId;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::Error,
    retry::{self, Backoff},
    store::{KeyValueStore, StoreExt, slot_key},
};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Idle,
    Busy,
    NeedsCleanup,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
struct SlotRecord {
    status: SlotStatus,
}

fn encode(status: SlotStatus) -> Result<String, Error> {
    Ok(serde_json::to_string(&SlotRecord { status })?)
}

/// Tracks which backend projects are in use.
///
/// Status transitions that claim a slot go through the store's
/// compare-and-set, so two workers never both see themselves holding it.
#[derive(Clone)]
pub struct LeaseRegistry {
    store: Arc<dyn KeyValueStore>,
    backoff: Backoff,
}

impl LeaseRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>, backoff: Backoff) -> Self {
        Self { store, backoff }
    }

    pub async fn status(&self, slot: &ProjectId) -> Result<Option<SlotStatus>, Error> {
        let record: Option<SlotRecord> = self.store.get(&slot_key(slot.as_str())).await?;
        Ok(record.map(|r| r.status))
    }

    /// Moves `slot` from `from` (`None` meaning no record) to `to`. Returns
    /// false if the slot was in any other state.
    pub async fn transition(
        &self,
        slot: &ProjectId,
        from: Option<SlotStatus>,
        to: SlotStatus,
    ) -> Result<bool, Error> {
        let expected = from.map(encode).transpose()?;
        self.store
            .compare_and_set(&slot_key(slot.as_str()), expected.as_deref(), &encode(to)?)
            .await
    }

    async fn claim_first(&self, candidates: &[ProjectId]) -> Result<Option<ProjectId>, Error> {
        for slot in candidates {
            for from in [None, Some(SlotStatus::Idle)] {
                if self.transition(slot, from, SlotStatus::Busy).await? {
                    return Ok(Some(slot.clone()));
                }
            }
        }
        Ok(None)
    }

    /// Marks the first idle (or never used) candidate busy and returns it.
    /// Rescans with backoff while every candidate is taken.
    pub async fn lease(&self, candidates: &[ProjectId]) -> Result<ProjectId, Error> {
        match retry::poll(self.backoff, |_| self.claim_first(candidates)).await? {
            Some(slot) => {
                debug!(%slot, "leased slot");
                Ok(slot)
            }
            None => {
                warn!(candidates = candidates.len(), "no idle slot");
                Err(Error::NoIdleResource {
                    attempts: self.backoff.attempts,
                })
            }
        }
    }

    /// Unconditionally records `status` for `slot`.
    pub async fn release(&self, slot: &ProjectId, status: SlotStatus) -> Result<(), Error> {
        debug!(%slot, ?status, "releasing slot");
        self.store
            .put(&slot_key(slot.as_str()), &SlotRecord { status }, None)
            .await
    }

    /// Drops the status record of a slot that no longer exists.
    pub async fn forget(&self, slot: &ProjectId) -> Result<(), Error> {
        self.store.delete(&slot_key(slot.as_str())).await
    }

    pub async fn acquire(&self, candidates: &[ProjectId]) -> Result<LeaseGuard, Error> {
        let slot = self.lease(candidates).await?;
        Ok(LeaseGuard {
            registry: self.clone(),
            slot,
            released: false,
        })
    }
}

/// A held slot. Dropping the guard without [`LeaseGuard::release`] still
/// marks the slot as needing cleanup.
pub struct LeaseGuard {
    registry: LeaseRegistry,
    slot: ProjectId,
    released: bool,
}

impl LeaseGuard {
    pub fn slot(&self) -> &ProjectId {
        &self.slot
    }

    pub async fn release(mut self, status: SlotStatus) -> Result<(), Error> {
        self.released = true;
        self.registry.release(&self.slot, status).await
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(slot = %self.slot, "lease dropped outside runtime, slot stays busy");
            return;
        };
        let registry = self.registry.clone();
        let slot = self.slot.clone();
        handle.spawn(async move {
            if let Err(err) = registry.release(&slot, SlotStatus::NeedsCleanup).await {
                warn!(%slot, ?err, "failed to release dropped lease");
            }
        });
    }
}
