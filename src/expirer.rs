//! Scheduled expiry of topics and request ids.
//!
//! A single worker owns the heap: it sleeps until the earliest deadline,
//! drains everything due, emits one `Expired` event per entry and re-arms.
//! Mutations from other tasks nudge the worker through a `Notify`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::storage::{KeyValueStorage, Store};
use crate::utils::unix_timestamp;

/// What an expiry entry points at: a topic, or a request id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Topic(String),
    Id(u64),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Topic(topic) => write!(f, "{topic}"),
            Target::Id(id) => write!(f, "id:{id}"),
        }
    }
}

impl FromStr for Target {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.strip_prefix("id:").and_then(|v| v.parse().ok()) {
            Some(id) => Target::Id(id),
            None => Target::Topic(s.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpiryRecord {
    pub target: String,
    pub expiry: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpirerEvent {
    Expired { target: Target },
}

#[derive(Default)]
struct State {
    /// `Reverse` makes the binary heap a min-heap on expiry.
    heap: BinaryHeap<Reverse<(u64, String)>>,
    /// Source of truth; heap entries not matching this map are stale.
    deadlines: HashMap<String, u64>,
}

pub struct Expirer {
    store: Store<ExpiryRecord>,
    state: Mutex<State>,
    events: broadcast::Sender<ExpirerEvent>,
    rearm: Notify,
}

impl Expirer {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            store: Store::new(storage, crate::constants::STORE_EXPIRATIONS),
            state: Mutex::new(State::default()),
            events,
            rearm: Notify::new(),
        }
    }

    /// Rehydrates persisted deadlines.
    pub async fn init(&self) -> Result<()> {
        self.store.init().await?;
        let mut state = self.state.lock().await;
        for record in self.store.values().await {
            state.deadlines.insert(record.target.clone(), record.expiry);
            state.heap.push(Reverse((record.expiry, record.target)));
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExpirerEvent> {
        self.events.subscribe()
    }

    /// Schedules (or reschedules) expiry for a target.
    pub async fn set(&self, target: &Target, expiry: u64) -> Result<()> {
        let key = target.to_string();
        self.store
            .set(
                &key,
                ExpiryRecord {
                    target: key.clone(),
                    expiry,
                },
            )
            .await?;
        let mut state = self.state.lock().await;
        state.deadlines.insert(key.clone(), expiry);
        state.heap.push(Reverse((expiry, key)));
        drop(state);
        self.rearm.notify_one();
        Ok(())
    }

    pub async fn has(&self, target: &Target) -> bool {
        self.state
            .lock()
            .await
            .deadlines
            .contains_key(&target.to_string())
    }

    pub async fn get(&self, target: &Target) -> Option<u64> {
        self.state
            .lock()
            .await
            .deadlines
            .get(&target.to_string())
            .copied()
    }

    /// Cancels a scheduled expiry. Unknown targets are a no-op.
    pub async fn delete(&self, target: &Target) {
        let key = target.to_string();
        let existed = self.state.lock().await.deadlines.remove(&key).is_some();
        if existed {
            let _ = self.store.delete(&key, "expiry cancelled").await;
            self.rearm.notify_one();
        }
    }

    /// Spawns the worker that fires `Expired` events. Aborting the returned
    /// handle stops all further emissions.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let expirer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let sleep_for = match expirer.next_deadline().await {
                    Some(deadline) => {
                        Duration::from_secs(deadline.saturating_sub(unix_timestamp()))
                    }
                    // nothing scheduled; wait for a set() nudge
                    None => Duration::from_secs(3600),
                };
                tokio::select! {
                    _ = expirer.rearm.notified() => {}
                    _ = tokio::time::sleep(sleep_for) => {
                        expirer.fire_due().await;
                    }
                }
            }
        })
    }

    async fn next_deadline(&self) -> Option<u64> {
        let mut state = self.state.lock().await;
        // drop stale heap heads so we never sleep on a cancelled entry
        while let Some(Reverse((expiry, key))) = state.heap.peek().cloned() {
            if state.deadlines.get(&key) == Some(&expiry) {
                return Some(expiry);
            }
            state.heap.pop();
        }
        None
    }

    async fn fire_due(&self) {
        let now = unix_timestamp();
        let mut due = Vec::new();
        {
            let mut state = self.state.lock().await;
            while let Some(Reverse((expiry, key))) = state.heap.peek().cloned() {
                if expiry > now {
                    break;
                }
                state.heap.pop();
                // an entry expires only if it is still current
                if state.deadlines.get(&key) == Some(&expiry) {
                    state.deadlines.remove(&key);
                    due.push(key);
                }
            }
        }
        for key in due {
            let _ = self.store.delete(&key, "expired").await;
            let target = key.parse::<Target>().expect("target parse is infallible");
            debug!("expired: {target}");
            let _ = self.events.send(ExpirerEvent::Expired { target });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn target_string_roundtrip() {
        let topic = Target::Topic("ab".repeat(32));
        assert_eq!(topic.to_string().parse::<Target>().unwrap(), topic);

        let id = Target::Id(42);
        assert_eq!(id.to_string(), "id:42");
        assert_eq!("id:42".parse::<Target>().unwrap(), id);
    }

    #[tokio::test]
    async fn set_has_delete() {
        let expirer = Expirer::new(Arc::new(MemoryStorage::new()));
        let target = Target::Topic("ab".repeat(32));

        expirer.set(&target, unix_timestamp() + 60).await.unwrap();
        assert!(expirer.has(&target).await);

        expirer.delete(&target).await;
        assert!(!expirer.has(&target).await);
        expirer.delete(&target).await; // no-op
    }

    #[tokio::test]
    async fn set_replaces_previous_deadline() {
        let expirer = Expirer::new(Arc::new(MemoryStorage::new()));
        let target = Target::Topic("ab".repeat(32));

        let now = unix_timestamp();
        expirer.set(&target, now + 60).await.unwrap();
        expirer.set(&target, now + 120).await.unwrap();
        assert_eq!(expirer.get(&target).await, Some(now + 120));
    }

    #[tokio::test]
    async fn due_entry_fires_exactly_once() {
        let expirer = Arc::new(Expirer::new(Arc::new(MemoryStorage::new())));
        let mut events = expirer.subscribe();
        let worker = expirer.start();

        let target = Target::Id(7);
        // boundary: expiry equal to now counts as already expired
        expirer.set(&target, unix_timestamp()).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("expiry should fire")
            .unwrap();
        assert_eq!(event, ExpirerEvent::Expired { target: target.clone() });
        assert!(!expirer.has(&target).await);

        // no second emission
        assert!(
            tokio::time::timeout(Duration::from_millis(200), events.recv())
                .await
                .is_err()
        );
        worker.abort();
    }

    #[tokio::test]
    async fn cancelled_entry_never_fires() {
        let expirer = Arc::new(Expirer::new(Arc::new(MemoryStorage::new())));
        let mut events = expirer.subscribe();
        let worker = expirer.start();

        let target = Target::Topic("cd".repeat(32));
        expirer.set(&target, unix_timestamp() + 1).await.unwrap();
        expirer.delete(&target).await;

        assert!(
            tokio::time::timeout(Duration::from_millis(1500), events.recv())
                .await
                .is_err()
        );
        worker.abort();
    }

    #[tokio::test]
    async fn rehydrates_from_store() {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
        let target = Target::Topic("ef".repeat(32));
        {
            let expirer = Expirer::new(storage.clone());
            expirer.set(&target, unix_timestamp() + 60).await.unwrap();
        }

        let expirer = Expirer::new(storage);
        expirer.init().await.unwrap();
        assert!(expirer.has(&target).await);
    }
}
