//! Correlation of inbound messages with waiting test steps
//!
//! One [`Inbox`] exists per listener. Each test run gets a [`RunPartition`]
//! holding its own identities, pending expectations and buffered messages,
//! so nothing leaks from one run into another. Dropping the partition
//! removes all of it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use feditest_common::{Error, ListenerConfig, Result};

use crate::identity::TestIdentity;

/// A protocol message accepted by the listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Local name of the addressed identity
    pub recipient: String,
    /// Actor id taken from the activity, if present
    pub sender: Option<String>,
    pub body: Value,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Validate a raw inbox body
    pub fn parse(recipient: &str, raw: &[u8]) -> Result<Self> {
        let body: Value = serde_json::from_slice(raw)
            .map_err(|e| Error::Protocol(format!("body is not JSON: {}", e)))?;
        let object = body
            .as_object()
            .ok_or_else(|| Error::Protocol("body is not a JSON object".to_string()))?;
        if !object.get("type").map(Value::is_string).unwrap_or(false) {
            return Err(Error::Protocol("activity has no type".to_string()));
        }
        let sender = object.get("actor").and_then(id_of);

        Ok(Self {
            recipient: recipient.to_string(),
            sender,
            body,
            received_at: Utc::now(),
        })
    }

    pub fn activity_type(&self) -> Option<&str> {
        self.body.get("type").and_then(Value::as_str)
    }

    pub fn object_id(&self) -> Option<String> {
        self.body.get("object").and_then(id_of)
    }
}

fn id_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(o) => o.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// Predicate over inbound messages
#[derive(Clone)]
pub struct Matcher {
    description: String,
    predicate: Arc<dyn Fn(&InboundMessage) -> bool + Send + Sync>,
}

impl Matcher {
    pub fn new<F>(description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&InboundMessage) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn any() -> Self {
        Self::new("any", |_| true)
    }

    /// Serialized body contains `text`
    pub fn contains(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(format!("contains({:?})", text), move |m| {
            m.body.to_string().contains(&text)
        })
    }

    pub fn from_actor(actor: impl Into<String>) -> Self {
        let actor = actor.into();
        Self::new(format!("from({})", actor), move |m| {
            m.sender.as_deref() == Some(actor.as_str())
        })
    }

    pub fn activity_type(activity_type: impl Into<String>) -> Self {
        let activity_type = activity_type.into();
        Self::new(format!("type({})", activity_type), move |m| {
            m.activity_type() == Some(activity_type.as_str())
        })
    }

    pub fn object_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(format!("object({})", id), move |m| {
            m.object_id().as_deref() == Some(id.as_str())
        })
    }

    pub fn and(self, other: Matcher) -> Self {
        let description = format!("{} && {}", self.description, other.description);
        Self::new(description, move |m| self.matches(m) && other.matches(m))
    }

    pub fn matches(&self, message: &InboundMessage) -> bool {
        (self.predicate)(message)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Matcher").field(&self.description).finish()
    }
}

/// An inbound message refused with a protocol error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedMessage {
    pub recipient: Option<String>,
    pub reason: String,
    pub received_at: DateTime<Utc>,
}

/// What happened to a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the earliest-registered matching expectation
    Matched { expectation: u64 },
    /// Kept for an expectation that may register shortly
    Buffered,
}

/// Registration returned by [`RunPartition::register_expectation`]
#[derive(Debug)]
pub struct ExpectationHandle {
    id: u64,
    recipient: String,
    description: String,
    timeout: Duration,
    receiver: oneshot::Receiver<InboundMessage>,
}

impl ExpectationHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

struct PendingReceipt {
    id: u64,
    recipient: String,
    matcher: Matcher,
    slot: oneshot::Sender<InboundMessage>,
}

struct Buffered {
    message: InboundMessage,
    at: Instant,
}

#[derive(Default)]
struct PartitionState {
    pending: Vec<PendingReceipt>,
    buffer: VecDeque<Buffered>,
    received: Vec<InboundMessage>,
}

impl PartitionState {
    fn purge_expired(&mut self, retention: Duration) {
        let now = Instant::now();
        self.buffer.retain(|b| now.duration_since(b.at) <= retention);
    }
}

#[derive(Default)]
struct InboxState {
    identities: HashMap<String, TestIdentity>,
    partitions: HashMap<String, PartitionState>,
    rejected: VecDeque<RejectedMessage>,
    next_expectation: u64,
}

/// The listener's single logical inbox, partitioned per run
pub struct Inbox {
    base_url: Url,
    buffer_capacity: usize,
    retention: Duration,
    rejection_log_capacity: usize,
    state: Mutex<InboxState>,
}

impl Inbox {
    pub fn new(config: &ListenerConfig, base_url: Url) -> Arc<Self> {
        Arc::new(Self {
            base_url,
            buffer_capacity: config.buffer_capacity.max(1),
            retention: config.retention(),
            rejection_log_capacity: config.rejection_log_capacity,
            state: Mutex::new(InboxState::default()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Open the partition for one run
    pub fn partition(self: &Arc<Self>, run_id: impl Into<String>, cancel: CancellationToken) -> RunPartition {
        let run_id = run_id.into();
        self.state
            .lock()
            .partitions
            .entry(run_id.clone())
            .or_default();
        debug!(run_id = %run_id, "Opened listener partition");

        RunPartition {
            inbox: Arc::clone(self),
            run_id,
            cancel,
        }
    }

    pub fn partition_count(&self) -> usize {
        self.state.lock().partitions.len()
    }

    /// Identity by local name
    pub fn identity(&self, name: &str) -> Option<TestIdentity> {
        self.state.lock().identities.get(name).cloned()
    }

    /// Identity named by a WebFinger resource
    pub fn find_identity(&self, resource: &str) -> Option<TestIdentity> {
        self.state
            .lock()
            .identities
            .values()
            .find(|i| i.answers_to(resource))
            .cloned()
    }

    /// Route an accepted message to its run
    pub fn deliver(&self, message: InboundMessage) -> Result<Delivery> {
        let mut state = self.state.lock();
        let run_id = state
            .identities
            .get(&message.recipient)
            .map(|i| i.run_id.clone())
            .ok_or_else(|| Error::Protocol(format!("unknown recipient {}", message.recipient)))?;
        let partition = state
            .partitions
            .get_mut(&run_id)
            .ok_or_else(|| Error::Protocol(format!("run {} is closed", run_id)))?;

        partition.received.push(message.clone());
        partition.pending.retain(|p| !p.slot.is_closed());

        let mut message = message;
        if let Some(pos) = partition
            .pending
            .iter()
            .position(|p| p.recipient == message.recipient && p.matcher.matches(&message))
        {
            let pending = partition.pending.remove(pos);
            match pending.slot.send(message) {
                Ok(()) => {
                    debug!(
                        run_id = %run_id,
                        expectation = pending.id,
                        matcher = pending.matcher.description(),
                        "Inbound message matched"
                    );
                    return Ok(Delivery::Matched {
                        expectation: pending.id,
                    });
                }
                Err(returned) => message = returned,
            }
        }

        partition.purge_expired(self.retention);
        partition.buffer.push_back(Buffered {
            message,
            at: Instant::now(),
        });
        while partition.buffer.len() > self.buffer_capacity {
            if let Some(evicted) = partition.buffer.pop_front() {
                debug!(run_id = %run_id, recipient = %evicted.message.recipient, "Evicted buffered message");
            }
        }
        debug!(run_id = %run_id, buffered = partition.buffer.len(), "Inbound message buffered");
        Ok(Delivery::Buffered)
    }

    /// Record a message refused with a protocol error
    pub fn reject(&self, recipient: Option<&str>, reason: impl Into<String>) {
        let rejected = RejectedMessage {
            recipient: recipient.map(str::to_string),
            reason: reason.into(),
            received_at: Utc::now(),
        };
        warn!(recipient = ?rejected.recipient, reason = %rejected.reason, "Rejected inbound message");

        let mut state = self.state.lock();
        state.rejected.push_back(rejected);
        while state.rejected.len() > self.rejection_log_capacity {
            state.rejected.pop_front();
        }
    }

    pub fn rejected(&self) -> Vec<RejectedMessage> {
        self.state.lock().rejected.iter().cloned().collect()
    }

    fn add_identity(&self, identity: TestIdentity) {
        self.state
            .lock()
            .identities
            .insert(identity.name.clone(), identity);
    }

    fn register(
        &self,
        run_id: &str,
        recipient: &str,
        matcher: Matcher,
        timeout: Duration,
    ) -> Result<ExpectationHandle> {
        let mut state = self.state.lock();
        let owned = state
            .identities
            .get(recipient)
            .map(|i| i.run_id == run_id)
            .unwrap_or(false);
        if !owned {
            return Err(Error::action(
                "register-expectation",
                format!("{} is not an identity of run {}", recipient, run_id),
            ));
        }

        state.next_expectation += 1;
        let id = state.next_expectation;
        let (slot, receiver) = oneshot::channel();
        let description = matcher.description().to_string();

        let partition = state.partitions.entry(run_id.to_string()).or_default();
        partition.purge_expired(self.retention);

        let buffered = partition
            .buffer
            .iter()
            .position(|b| b.message.recipient == recipient && matcher.matches(&b.message));
        match buffered.and_then(|pos| partition.buffer.remove(pos)) {
            Some(b) => {
                debug!(run_id = %run_id, expectation = id, "Expectation satisfied from buffer");
                let _ = slot.send(b.message);
            }
            None => partition.pending.push(PendingReceipt {
                id,
                recipient: recipient.to_string(),
                matcher,
                slot,
            }),
        }

        Ok(ExpectationHandle {
            id,
            recipient: recipient.to_string(),
            description,
            timeout,
            receiver,
        })
    }

    fn forget(&self, run_id: &str, expectation: u64) {
        if let Some(partition) = self.state.lock().partitions.get_mut(run_id) {
            partition.pending.retain(|p| p.id != expectation);
        }
    }

    fn close_partition(&self, run_id: &str) {
        let mut state = self.state.lock();
        state.partitions.remove(run_id);
        state.identities.retain(|_, i| i.run_id != run_id);
        debug!(run_id = %run_id, "Closed listener partition");
    }
}

/// One run's view of the inbox
pub struct RunPartition {
    inbox: Arc<Inbox>,
    run_id: String,
    cancel: CancellationToken,
}

impl RunPartition {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The run was aborted by the operator
    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Create an identity owned by this run
    pub fn create_identity(&self, label: &str) -> TestIdentity {
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", label, &suffix[..8]);
        let identity = TestIdentity::new(name, self.run_id.clone(), self.inbox.base_url());
        self.inbox.add_identity(identity.clone());
        identity
    }

    pub fn identities(&self) -> Vec<TestIdentity> {
        let state = self.inbox.state.lock();
        let mut identities: Vec<_> = state
            .identities
            .values()
            .filter(|i| i.run_id == self.run_id)
            .cloned()
            .collect();
        identities.sort_by(|a, b| a.name.cmp(&b.name));
        identities
    }

    /// Register a predicate for messages to `recipient`; returns immediately
    pub fn register_expectation(
        &self,
        recipient: &str,
        matcher: Matcher,
        timeout: Duration,
    ) -> Result<ExpectationHandle> {
        self.inbox.register(&self.run_id, recipient, matcher, timeout)
    }

    /// Wait until the expectation is fulfilled, its timeout elapses, or the
    /// run is aborted
    pub async fn await_message(&self, handle: ExpectationHandle) -> Result<InboundMessage> {
        let ExpectationHandle {
            id,
            recipient,
            description,
            timeout,
            mut receiver,
        } = handle;
        let started = Instant::now();

        let outcome = tokio::select! {
            received = tokio::time::timeout(timeout, &mut receiver) => {
                received.ok().and_then(|r| r.ok())
            }
            _ = self.cancel.cancelled() => None,
        };
        if let Some(message) = outcome {
            return Ok(message);
        }

        self.inbox.forget(&self.run_id, id);
        if let Ok(message) = receiver.try_recv() {
            return Ok(message);
        }

        if self.cancel.is_cancelled() {
            let operation = format!("await-inbound {} for {} (aborted)", description, recipient);
            Err(Error::timeout(operation, started.elapsed()))
        } else {
            let operation = format!("await-inbound {} for {}", description, recipient);
            Err(Error::timeout(operation, timeout))
        }
    }

    /// Register and wait in one call
    pub async fn receive(
        &self,
        recipient: &str,
        matcher: Matcher,
        timeout: Duration,
    ) -> Result<InboundMessage> {
        let handle = self.register_expectation(recipient, matcher, timeout)?;
        self.await_message(handle).await
    }

    /// Every message delivered to this run, in arrival order
    pub fn received(&self) -> Vec<InboundMessage> {
        self.inbox
            .state
            .lock()
            .partitions
            .get(&self.run_id)
            .map(|p| p.received.clone())
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.inbox
            .state
            .lock()
            .partitions
            .get(&self.run_id)
            .map(|p| p.pending.len())
            .unwrap_or(0)
    }
}

impl Drop for RunPartition {
    fn drop(&mut self) {
        self.inbox.close_partition(&self.run_id);
    }
}

impl fmt::Debug for RunPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunPartition")
            .field("run_id", &self.run_id)
            .finish()
    }
}
