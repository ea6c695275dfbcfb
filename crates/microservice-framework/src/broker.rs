//! # In-Memory Message Broker
//!
//! A process-local implementation of the [`MessageBroker`] collaborator that follows
//! the partitioned-log model:
//!
//! - **Topics** are split into partitions; each partition is an append-only log with
//!   dense offsets starting at 0. Keyed records always land on the same partition,
//!   unkeyed records are spread round-robin.
//! - **Consumer groups** share partitions: each partition is assigned to exactly one
//!   member at a time (round-robin over the members subscribed to that topic, in join
//!   order). Every join and leave triggers a rebalance.
//! - **Offsets**: the group stores one committed offset per partition (the next
//!   offset to deliver). On rebalance every member resumes from the committed
//!   offsets, so records that were delivered but never committed are delivered again.
//! - **Membership** ends on `close`, or when the subscription is dropped without
//!   one (for example while a panicking receive loop unwinds).
//!
//! Used by the sample service and by tests; a networked broker would implement the
//! same two traits.

use crate::consumer::{BrokerSubscription, ConsumerRecord, MessageBroker, TopicPartition};
use crate::error::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

struct StoredRecord {
    key: Option<String>,
    payload: Bytes,
}

struct Topic {
    partitions: Vec<Vec<StoredRecord>>,
    next_unkeyed: usize,
}

struct Member {
    consumer_id: String,
    topics: Vec<String>,
}

#[derive(Default)]
struct Group {
    members: Vec<Member>,
    assignments: HashMap<String, Vec<TopicPartition>>,
    committed: HashMap<TopicPartition, u64>,
    positions: HashMap<TopicPartition, u64>,
    generation: u64,
}

#[derive(Default)]
struct BrokerState {
    topics: BTreeMap<String, Topic>,
    groups: HashMap<String, Group>,
}

struct Shared {
    state: Mutex<BrokerState>,
    arrivals: Notify,
}

/// Process-local partitioned broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                arrivals: Notify::new(),
            }),
        }
    }

    /// Creates `name` with `partitions` partitions (at least one). Existing topics
    /// are left untouched.
    pub fn create_topic(&self, name: &str, partitions: u32) {
        let mut state = self.shared.state.lock();
        state.topics.entry(name.to_string()).or_insert_with(|| Topic {
            partitions: (0..partitions.max(1)).map(|_| Vec::new()).collect(),
            next_unkeyed: 0,
        });
        info!(topic = name, partitions, "Topic created");
    }

    /// Appends a record and returns its partition and offset.
    pub fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: impl Into<Bytes>,
    ) -> Result<(u32, u64), BrokerError> {
        let placed = {
            let mut state = self.shared.state.lock();
            let log = state
                .topics
                .get_mut(topic)
                .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;
            let count = log.partitions.len();
            let partition = match key {
                Some(k) => {
                    let mut hasher = DefaultHasher::new();
                    k.hash(&mut hasher);
                    (hasher.finish() % count as u64) as usize
                }
                None => {
                    let p = log.next_unkeyed % count;
                    log.next_unkeyed = log.next_unkeyed.wrapping_add(1);
                    p
                }
            };
            let records = &mut log.partitions[partition];
            records.push(StoredRecord {
                key: key.map(str::to_string),
                payload: payload.into(),
            });
            (partition as u32, (records.len() - 1) as u64)
        };
        self.shared.arrivals.notify_waiters();
        Ok(placed)
    }

    /// Next offset the group will consume from `topic`/`partition`, if it ever committed.
    pub fn committed(&self, group_id: &str, topic: &str, partition: u32) -> Option<u64> {
        let state = self.shared.state.lock();
        state
            .groups
            .get(group_id)?
            .committed
            .get(&TopicPartition::new(topic, partition))
            .copied()
    }

    /// Number of records in `topic`/`partition`.
    pub fn end_offset(&self, topic: &str, partition: u32) -> Option<u64> {
        let state = self.shared.state.lock();
        let log = state.topics.get(topic)?;
        log.partitions.get(partition as usize).map(|p| p.len() as u64)
    }

    /// Current members of a group, in join order.
    pub fn members(&self, group_id: &str) -> Vec<String> {
        let state = self.shared.state.lock();
        state
            .groups
            .get(group_id)
            .map(|g| g.members.iter().map(|m| m.consumer_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Partitions currently assigned to `consumer_id` within `group_id`.
    pub fn assignment(&self, group_id: &str, consumer_id: &str) -> Vec<TopicPartition> {
        let state = self.shared.state.lock();
        state
            .groups
            .get(group_id)
            .and_then(|g| g.assignments.get(consumer_id).cloned())
            .unwrap_or_default()
    }
}

fn rebalance(topics: &BTreeMap<String, Topic>, group_id: &str, group: &mut Group) {
    group.generation += 1;
    group.assignments = group
        .members
        .iter()
        .map(|m| (m.consumer_id.clone(), Vec::new()))
        .collect();

    for (name, topic) in topics {
        let subscribers: Vec<&Member> = group
            .members
            .iter()
            .filter(|m| m.topics.iter().any(|t| t == name))
            .collect();
        if subscribers.is_empty() {
            continue;
        }
        for partition in 0..topic.partitions.len() {
            let owner = &subscribers[partition % subscribers.len()].consumer_id;
            if let Some(owned) = group.assignments.get_mut(owner) {
                owned.push(TopicPartition::new(name.as_str(), partition as u32));
            }
        }
    }

    // Everyone resumes from the last commit.
    group.positions = group.committed.clone();
    debug!(group = group_id, generation = group.generation, assignments = ?group.assignments, "Group rebalanced");
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn subscribe(
        &self,
        group_id: &str,
        consumer_id: &str,
        topics: &[String],
    ) -> Result<Box<dyn BrokerSubscription>, BrokerError> {
        if topics.is_empty() {
            return Err(BrokerError::EmptySubscription(consumer_id.to_string()));
        }
        {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            if let Some(missing) = topics.iter().find(|t| !state.topics.contains_key(*t)) {
                return Err(BrokerError::UnknownTopic(missing.clone()));
            }
            let group = state.groups.entry(group_id.to_string()).or_default();
            if group.members.iter().any(|m| m.consumer_id == consumer_id) {
                return Err(BrokerError::DuplicateMember {
                    group_id: group_id.to_string(),
                    consumer_id: consumer_id.to_string(),
                });
            }
            group.members.push(Member {
                consumer_id: consumer_id.to_string(),
                topics: topics.to_vec(),
            });
            rebalance(&state.topics, group_id, group);
        }
        info!(group = group_id, consumer_id, ?topics, "Consumer joined group");
        Ok(Box::new(InMemorySubscription {
            shared: self.shared.clone(),
            group_id: group_id.to_string(),
            consumer_id: consumer_id.to_string(),
            closed: false,
        }))
    }
}

/// A group member's subscription to an [`InMemoryBroker`].
pub struct InMemorySubscription {
    shared: Arc<Shared>,
    group_id: String,
    consumer_id: String,
    closed: bool,
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.leave() {
                debug!(consumer_id = %self.consumer_id, error = %e, "Dropped subscription was not a member");
            }
        }
    }
}

impl InMemorySubscription {
    fn leave(&mut self) -> Result<(), BrokerError> {
        self.closed = true;
        {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let group = state.groups.get_mut(&self.group_id).ok_or_else(|| self.not_member())?;
            let before = group.members.len();
            group.members.retain(|m| m.consumer_id != self.consumer_id);
            if group.members.len() == before {
                return Err(self.not_member());
            }
            group.assignments.remove(&self.consumer_id);
            rebalance(&state.topics, &self.group_id, group);
        }
        info!(group = %self.group_id, consumer_id = %self.consumer_id, "Consumer left group");
        self.shared.arrivals.notify_waiters();
        Ok(())
    }

    fn not_member(&self) -> BrokerError {
        BrokerError::NotMember {
            group_id: self.group_id.clone(),
            consumer_id: self.consumer_id.clone(),
        }
    }

    fn take_available(&self, max_records: usize) -> Result<Vec<ConsumerRecord>, BrokerError> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        let group = state.groups.get_mut(&self.group_id).ok_or_else(|| self.not_member())?;
        let owned = group
            .assignments
            .get(&self.consumer_id)
            .cloned()
            .ok_or_else(|| self.not_member())?;

        let mut batch = Vec::new();
        for tp in owned {
            if batch.len() >= max_records {
                break;
            }
            let Some(log) = state
                .topics
                .get(&tp.topic)
                .and_then(|t| t.partitions.get(tp.partition as usize))
            else {
                continue;
            };
            // A commit that landed after the last rebalance moves the position too.
            let position = group
                .positions
                .get(&tp)
                .copied()
                .unwrap_or(0)
                .max(group.committed.get(&tp).copied().unwrap_or(0));
            let take = (max_records - batch.len()).min(log.len().saturating_sub(position as usize));
            for offset in position..position + take as u64 {
                let stored = &log[offset as usize];
                batch.push(ConsumerRecord {
                    topic: tp.topic.clone(),
                    partition: tp.partition,
                    offset,
                    key: stored.key.clone(),
                    payload: stored.payload.clone(),
                });
            }
            group.positions.insert(tp, position + take as u64);
        }
        Ok(batch)
    }
}

#[async_trait]
impl BrokerSubscription for InMemorySubscription {
    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<Vec<ConsumerRecord>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let arrival = self.shared.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            let batch = self.take_available(max_records.max(1))?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, arrival).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(&mut self, records: &[ConsumerRecord]) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock();
        let group = state.groups.get_mut(&self.group_id).ok_or_else(|| self.not_member())?;
        let owned = group
            .assignments
            .get(&self.consumer_id)
            .cloned()
            .ok_or_else(|| self.not_member())?;
        for record in records {
            let tp = TopicPartition::new(record.topic.as_str(), record.partition);
            if !owned.contains(&tp) {
                // Partition moved to another member; its new owner will redeliver.
                debug!(consumer_id = %self.consumer_id, partition = %tp, "Skipping commit for revoked partition");
                continue;
            }
            let next = record.offset + 1;
            let committed = group.committed.entry(tp).or_insert(0);
            *committed = (*committed).max(next);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if self.closed {
            return Ok(());
        }
        self.leave()
    }

    fn assignment(&self) -> Vec<TopicPartition> {
        let state = self.shared.state.lock();
        state
            .groups
            .get(&self.group_id)
            .and_then(|g| g.assignments.get(&self.consumer_id).cloned())
            .unwrap_or_default()
    }
}
