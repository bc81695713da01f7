//! Pending transaction table
//!
//! Owned by the engine task, never shared. Each match key has at most one
//! active (transmitted) transaction plus a queue of requests waiting for the
//! same key.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use xcom_protocol::{Frame, Result, ServiceId};

use crate::config::DuplicatePolicy;

pub type TransactionId = u64;

/// Lifecycle of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Pending,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

/// Correlation key: service, object id and device address
///
/// Requests are keyed by their destination, responses by their source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchKey {
    pub service: ServiceId,
    pub object_id: u16,
    pub address: u16,
}

impl MatchKey {
    pub fn for_request(frame: &Frame) -> Self {
        Self {
            service: frame.service,
            object_id: frame.object_id,
            address: frame.dst,
        }
    }

    /// Request keys a response frame can answer
    ///
    /// An error response carries no hint of the service it answers, so it is
    /// a candidate for both.
    pub fn candidates(frame: &Frame) -> Vec<Self> {
        let key = |service| Self {
            service,
            object_id: frame.object_id,
            address: frame.src,
        };
        match frame.service {
            ServiceId::Read => vec![key(ServiceId::Read)],
            ServiceId::Write | ServiceId::Ack => vec![key(ServiceId::Write)],
            ServiceId::Error => vec![key(ServiceId::Read), key(ServiceId::Write)],
        }
    }
}

impl fmt::Display for MatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}@{}", self.service, self.object_id, self.address)
    }
}

/// One request awaiting its response
#[derive(Debug)]
pub struct PendingTransaction {
    pub id: TransactionId,
    pub key: MatchKey,
    pub request: Frame,
    pub encoded: Bytes,
    pub timeout: Duration,
    /// Retransmissions still allowed
    pub retries_left: u32,
    /// Transmissions so far
    pub attempts: u32,
    /// Set when transmitted, `None` while queued
    pub deadline: Option<Instant>,
    pub issued_at: Instant,
    pub reply: oneshot::Sender<Result<Frame>>,
}

impl PendingTransaction {
    pub fn new(
        id: TransactionId,
        request: Frame,
        encoded: Bytes,
        timeout: Duration,
        retries: u32,
        reply: oneshot::Sender<Result<Frame>>,
    ) -> Self {
        Self {
            id,
            key: MatchKey::for_request(&request),
            request,
            encoded,
            timeout,
            retries_left: retries,
            attempts: 0,
            deadline: None,
            issued_at: Instant::now(),
            reply,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.issued_at.elapsed()
    }

    /// Whether `response` echoes this request's object type and property
    ///
    /// The match key alone cannot tell a level read from a value read of the
    /// same object.
    pub fn is_answered_by(&self, response: &Frame) -> bool {
        self.request.object_type == response.object_type
            && self.request.property_id == response.property_id
    }

    /// Hand the outcome to the waiting caller
    pub fn complete(self, outcome: Result<Frame>) {
        // caller may have gone away; nothing to do then
        let _ = self.reply.send(outcome);
    }
}

/// Outcome of [`PendingTable::submit`]
#[derive(Debug)]
pub enum Admission {
    /// Became active, transmit now
    Active(MatchKey),
    /// Waiting behind the active transaction with the same key
    Queued,
    /// Same key in flight and the policy is reject
    Rejected(PendingTransaction),
}

/// What to do with an active transaction whose deadline passed
#[derive(Debug)]
pub enum Expiry {
    Retransmit(MatchKey),
    Exhausted {
        tx: PendingTransaction,
        promoted: Option<MatchKey>,
    },
}

/// A transaction taken out of the table by a response
#[derive(Debug)]
pub struct Resolved {
    pub tx: PendingTransaction,
    /// More than one active transaction matched
    pub ambiguous: bool,
    /// Key whose next queued transaction became active
    pub promoted: Option<MatchKey>,
}

#[derive(Debug)]
struct KeySlot {
    active: PendingTransaction,
    queue: VecDeque<PendingTransaction>,
}

#[derive(Debug)]
pub struct PendingTable {
    slots: HashMap<MatchKey, KeySlot>,
    index: HashMap<TransactionId, MatchKey>,
    policy: DuplicatePolicy,
}

impl PendingTable {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            slots: HashMap::new(),
            index: HashMap::new(),
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Number of transactions that have been transmitted and await a response
    pub fn active_count(&self) -> usize {
        self.slots.len()
    }

    pub fn submit(&mut self, tx: PendingTransaction) -> Admission {
        let key = tx.key;
        match self.slots.get_mut(&key) {
            None => {
                self.index.insert(tx.id, key);
                self.slots.insert(
                    key,
                    KeySlot {
                        active: tx,
                        queue: VecDeque::new(),
                    },
                );
                Admission::Active(key)
            },
            Some(_) if self.policy == DuplicatePolicy::Reject => Admission::Rejected(tx),
            Some(slot) => {
                self.index.insert(tx.id, key);
                slot.queue.push_back(tx);
                Admission::Queued
            },
        }
    }

    /// Mark the active transaction of `key` as transmitted
    ///
    /// Returns the bytes to write. The deadline restarts from `now`.
    pub fn arm(&mut self, key: &MatchKey, now: Instant) -> Option<(TransactionId, u32, Bytes)> {
        let tx = &mut self.slots.get_mut(key)?.active;
        tx.attempts += 1;
        tx.deadline = Some(now + tx.timeout);
        Some((tx.id, tx.attempts, tx.encoded.clone()))
    }

    /// Key of the transmitted transaction `response` answers, if any
    pub fn awaiting(&self, response: &Frame) -> Option<MatchKey> {
        MatchKey::candidates(response).into_iter().find(|k| {
            self.slots
                .get(k)
                .is_some_and(|s| s.active.deadline.is_some() && s.active.is_answered_by(response))
        })
    }

    /// Earliest deadline among active transactions
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.values().filter_map(|s| s.active.deadline).min()
    }

    /// Keys whose active transaction is past its deadline
    pub fn expired(&self, now: Instant) -> Vec<MatchKey> {
        self.slots
            .iter()
            .filter(|(_, s)| s.active.deadline.is_some_and(|d| d <= now))
            .map(|(k, _)| *k)
            .collect()
    }

    /// Spend one retry, or take the transaction out when none are left
    pub fn expire(&mut self, key: &MatchKey) -> Option<Expiry> {
        let slot = self.slots.get_mut(key)?;
        if slot.active.retries_left > 0 {
            slot.active.retries_left -= 1;
            slot.active.deadline = None;
            return Some(Expiry::Retransmit(*key));
        }
        let (tx, promoted) = self.take_active(key)?;
        Some(Expiry::Exhausted { tx, promoted })
    }

    /// Take the oldest active transaction `response` answers
    ///
    /// A response whose property differs from the request's leaves the table
    /// untouched.
    pub fn resolve(&mut self, response: &Frame) -> Option<Resolved> {
        let matching: Vec<(MatchKey, Instant)> = MatchKey::candidates(response)
            .into_iter()
            .filter_map(|k| {
                self.slots
                    .get(&k)
                    .filter(|s| s.active.is_answered_by(response))
                    .map(|s| (k, s.active.issued_at))
            })
            .collect();

        let (key, _) = *matching.iter().min_by_key(|(_, issued)| *issued)?;
        let ambiguous = matching.len() > 1;
        let (tx, promoted) = self.take_active(&key)?;
        Some(Resolved {
            tx,
            ambiguous,
            promoted,
        })
    }

    /// Remove a transaction wherever it is
    ///
    /// Returns the transaction and, if it was active, the key whose queued
    /// successor must now be transmitted.
    pub fn cancel(&mut self, id: TransactionId) -> Option<(PendingTransaction, Option<MatchKey>)> {
        let key = *self.index.get(&id)?;
        let slot = self.slots.get_mut(&key)?;

        if slot.active.id == id {
            return self.take_active(&key);
        }

        let pos = slot.queue.iter().position(|tx| tx.id == id)?;
        let tx = slot.queue.remove(pos)?;
        self.index.remove(&id);
        Some((tx, None))
    }

    /// Remove everything, active transactions first
    pub fn drain(&mut self) -> Vec<PendingTransaction> {
        let mut out = Vec::with_capacity(self.index.len());
        for (_, slot) in self.slots.drain() {
            out.push(slot.active);
            out.extend(slot.queue);
        }
        self.index.clear();
        out
    }

    fn take_active(&mut self, key: &MatchKey) -> Option<(PendingTransaction, Option<MatchKey>)> {
        let mut slot = self.slots.remove(key)?;
        self.index.remove(&slot.active.id);

        match slot.queue.pop_front() {
            Some(next) => {
                let done = std::mem::replace(&mut slot.active, next);
                self.slots.insert(*key, slot);
                Some((done, Some(*key)))
            },
            None => Some((slot.active, None)),
        }
    }
}
