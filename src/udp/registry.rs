use crate::udp::bridge::Bridge;
use crate::udp::packet::SessionId;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// A reserved registry entry, populated once the bridge exists
type Slot = Arc<OnceCell<Arc<Bridge>>>;

/// Live bridges keyed by session id.
///
/// Creation is split in two steps: a slot is reserved under the map's shard
/// lock, then populated outside of it. Concurrent callers for the same session
/// wait on the same slot, while other sessions are never blocked by a pending
/// directory lookup.
#[derive(Default)]
pub struct BridgeRegistry {
    slots: DashMap<SessionId, Slot>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the bridge for a session if one is established
    pub fn get(&self, session: &SessionId) -> Option<Arc<Bridge>> {
        self.slots
            .get(session)
            .and_then(|slot| slot.value().get().cloned())
    }

    /// Get the bridge for a session, creating it with `factory` if needed.
    ///
    /// `factory` runs at most once per session at a time. If it fails the
    /// reservation is rolled back and the error returned. `Ok(None)` means the
    /// session was removed while its bridge was being created; that bridge has
    /// already been interrupted.
    pub async fn get_or_create<F, Fut, E>(
        &self,
        session: SessionId,
        factory: F,
    ) -> Result<Option<Arc<Bridge>>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Bridge>, E>>,
    {
        let slot = Arc::clone(self.slots.entry(session).or_default().value());

        match slot.get_or_try_init(factory).await {
            Ok(bridge) => {
                let bridge = Arc::clone(bridge);
                if self.holds(&session, &slot) {
                    Ok(Some(bridge))
                } else {
                    debug!("Session {} was released while its bridge was opening", session);
                    bridge.interrupt();
                    Ok(None)
                }
            }
            Err(e) => {
                // Waiters on this slot run their own factory next, so keep it
                // unless the map and this call are its only holders
                self.slots.remove_if(&session, |_, current| {
                    Arc::ptr_eq(current, &slot)
                        && current.get().is_none()
                        && Arc::strong_count(current) == 2
                });
                Err(e)
            }
        }
    }

    /// Detach the bridge of a session. The caller is responsible for interrupting it.
    pub fn remove(&self, session: &SessionId) -> Option<Arc<Bridge>> {
        self.slots
            .remove(session)
            .and_then(|(_, slot)| slot.get().cloned())
    }

    /// Detach `bridge` only if it is still the one registered for `session`
    pub fn evict(&self, session: &SessionId, bridge: &Arc<Bridge>) -> bool {
        self.slots
            .remove_if(session, |_, slot| {
                slot.get().is_some_and(|current| Arc::ptr_eq(current, bridge))
            })
            .is_some()
    }

    /// Detach every bridge, for bulk teardown
    pub fn remove_all(&self) -> Vec<Arc<Bridge>> {
        let sessions: Vec<SessionId> = self.slots.iter().map(|entry| *entry.key()).collect();
        sessions
            .iter()
            .filter_map(|session| self.remove(session))
            .collect()
    }

    /// Number of established bridges
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn holds(&self, session: &SessionId, slot: &Slot) -> bool {
        self.slots
            .get(session)
            .is_some_and(|current| Arc::ptr_eq(current.value(), slot))
    }
}
