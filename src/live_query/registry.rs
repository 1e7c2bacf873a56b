// src/live_query/registry.rs

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::live_query::messages::RequestId;
use crate::live_query::subscription::SubscriptionHandler;
use crate::query::{ParseQuery, QueryIdentity};

/// One registered subscription.
#[derive(Clone)]
pub struct SubscriptionRecord {
    pub query: ParseQuery,
    pub identity: QueryIdentity,
    pub handler: Arc<dyn SubscriptionHandler>,
}

impl SubscriptionRecord {
    pub fn new(query: ParseQuery, handler: Arc<dyn SubscriptionHandler>) -> Self {
        Self {
            identity: query.identity(),
            query,
            handler,
        }
    }

    fn handler_addr(&self) -> *const () {
        Arc::as_ptr(&self.handler) as *const ()
    }
}

impl std::fmt::Debug for SubscriptionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRecord")
            .field("query", &self.query)
            .finish_non_exhaustive()
    }
}

/// The subscriptions of one LiveQuery client, split into those waiting for a
/// server acknowledgment (`pending`) and those the server confirmed (`active`).
///
/// Both maps are keyed by request id. A request id sits in both maps only while an
/// `update` of an active subscription waits for its acknowledgment.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    pending: BTreeMap<RequestId, SubscriptionRecord>,
    active: BTreeMap<RequestId, SubscriptionRecord>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff a confirmed subscription exists for a query structurally equal to `query`.
    pub fn is_subscribed(&self, query: &ParseQuery) -> bool {
        let identity = query.identity();
        self.active.values().any(|record| record.identity == identity)
    }

    /// True iff a subscription for `query` is waiting for its acknowledgment.
    pub fn is_pending_subscription(&self, query: &ParseQuery) -> bool {
        let identity = query.identity();
        self.pending.values().any(|record| record.identity == identity)
    }

    /// Drops pending entries for `query`. Absent entries are not an error.
    pub fn remove_pending_subscription(&mut self, query: &ParseQuery) {
        let identity = query.identity();
        self.pending.retain(|_, record| record.identity != identity);
    }

    /// Drops active entries for `query`. Absent entries are not an error.
    pub fn remove_subscription(&mut self, query: &ParseQuery) {
        let identity = query.identity();
        self.active.retain(|_, record| record.identity != identity);
    }

    pub fn insert_pending(&mut self, request_id: RequestId, record: SubscriptionRecord) {
        self.pending.insert(request_id, record);
    }

    /// Moves a pending entry to the active set. Returns the record and whether this
    /// acknowledgment is new, i.e. the request id was not already active.
    /// `None` for unknown or already acknowledged request ids.
    pub fn promote(&mut self, request_id: RequestId) -> Option<(SubscriptionRecord, bool)> {
        let record = self.pending.remove(&request_id)?;
        let is_new = !self.active.contains_key(&request_id);
        self.active.insert(request_id, record.clone());
        Some((record, is_new))
    }

    /// Removes `request_id` from both sets, returning the most recent record.
    pub fn remove_request(&mut self, request_id: RequestId) -> Option<SubscriptionRecord> {
        let pending = self.pending.remove(&request_id);
        let active = self.active.remove(&request_id);
        pending.or(active)
    }

    pub fn active(&self, request_id: RequestId) -> Option<&SubscriptionRecord> {
        self.active.get(&request_id)
    }

    /// Looks `request_id` up in either set, preferring the pending one.
    pub fn get(&self, request_id: RequestId) -> Option<&SubscriptionRecord> {
        self.pending
            .get(&request_id)
            .or_else(|| self.active.get(&request_id))
    }

    /// Request id currently used for `query`, active entries first.
    pub fn request_id_for_query(&self, query: &ParseQuery) -> Option<RequestId> {
        let identity = query.identity();
        self.active
            .iter()
            .chain(self.pending.iter())
            .find(|(_, record)| record.identity == identity)
            .map(|(request_id, _)| *request_id)
    }

    /// Request id under which `handler` is registered, active entries first.
    pub fn request_id_for_handler(
        &self,
        handler: &Arc<dyn SubscriptionHandler>,
    ) -> Option<RequestId> {
        let addr = Arc::as_ptr(handler) as *const ();
        self.active
            .iter()
            .chain(self.pending.iter())
            .find(|(_, record)| record.handler_addr() == addr)
            .map(|(request_id, _)| *request_id)
    }

    /// Moves every active subscription back to pending so it is replayed on the
    /// next handshake. A pending entry for the same request id (an in-flight
    /// update) takes precedence over the active one.
    pub fn demote_all(&mut self) {
        let active = std::mem::take(&mut self.active);
        for (request_id, record) in active {
            self.pending.entry(request_id).or_insert(record);
        }
    }

    /// Pending entries in request id order.
    pub fn pending(&self) -> impl Iterator<Item = (RequestId, &SubscriptionRecord)> {
        self.pending.iter().map(|(request_id, record)| (*request_id, record))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn pending_request_ids(&self) -> Vec<RequestId> {
        self.pending.keys().copied().collect()
    }

    pub fn active_request_ids(&self) -> Vec<RequestId> {
        self.active.keys().copied().collect()
    }
}
