//! # Route Table Engine
//!
//! A route table is an immutable snapshot mapping `(message type,
//! subscription id)` to an ordered list of round-robin groups of endpoints,
//! plus a managed-element-id map for the message types that route on the
//! MEID field instead. Tables are built off to the side (by the collector
//! parsing textual updates, see [`parse`]) and installed with a single
//! atomic swap; senders clone the `Arc` for the duration of one send, so a
//! retired table lives exactly as long as its last in-flight reference.
//!
//! ## Key encoding
//!
//! Entries are keyed `key = (sub_id << 32) | mtype` with both halves taken
//! as their unsigned 32-bit patterns. The "any" subscription id (-1)
//! therefore keys as `0xffffffff_xxxxxxxx`, and the fallback probe for a
//! missed `(mtype, sub_id)` lookup is just a second pull with the high word
//! forced to ones.

pub mod parse;
pub mod rtc;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::msg::UNSET_SUBID;
use crate::session::Endpoint;
use crate::symtab::SymTab;

/// Symbol-table class for managed-element-id entries.
pub(crate) const MEID_SPACE: u32 = 2;

/// Build the 64-bit entry key for a message type / subscription id pair.
/// The same encoding is used for every insert and every lookup.
#[inline]
pub fn build_key(sub_id: i32, mtype: i32) -> u64 {
    ((sub_id as u32 as u64) << 32) | (mtype as u32 as u64)
}

/// One round-robin set of endpoints within a route entry.
pub struct RrGroup {
    eps: Vec<Arc<Endpoint>>,
    cursor: AtomicUsize,
}

impl RrGroup {
    pub(crate) fn new(eps: Vec<Arc<Endpoint>>) -> Self {
        Self { eps, cursor: AtomicUsize::new(0) }
    }

    /// Endpoints in this group.
    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.eps
    }

    /// Select the next endpoint, advancing the rolling cursor. Concurrent
    /// callers may observe repeats across sessions; strict fairness is not
    /// required, only that every member is visited over a full cycle.
    pub fn select(&self) -> Option<Arc<Endpoint>> {
        if self.eps.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.eps.len();
        Some(Arc::clone(&self.eps[i]))
    }
}

/// Route table entry: the ordered group list for one `(mtype, sub_id)` key.
pub struct RouteEntry {
    pub key: u64,
    pub mtype: i32,
    pub sub_id: i32,
    /// Entry was declared with `%meid`: the destination comes from the
    /// message's managed-element id via the table's MEID map.
    pub route_by_meid: bool,
    groups: Vec<RrGroup>,
}

impl RouteEntry {
    pub(crate) fn new(mtype: i32, sub_id: i32, groups: Vec<RrGroup>, route_by_meid: bool) -> Self {
        Self { key: build_key(sub_id, mtype), mtype, sub_id, route_by_meid, groups }
    }

    /// Number of round-robin groups; a send fans out across all of them.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Round-robin selection within one group. The second element reports
    /// whether further groups exist past `group`.
    pub fn select(&self, group: usize) -> (Option<Arc<Endpoint>>, bool) {
        let more = group + 1 < self.groups.len();
        match self.groups.get(group) {
            Some(g) => (g.select(), more),
            None => (None, false),
        }
    }

    pub(crate) fn groups(&self) -> &[RrGroup] {
        &self.groups
    }
}

/// Immutable routing snapshot. Built by the collector, swapped into the
/// context's active slot, and shared read-only from then on.
pub struct RouteTable {
    entries: SymTab<Arc<RouteEntry>>,
    meids: SymTab<Arc<Endpoint>>,
    /// Count of update records accepted while building this table.
    pub updates: u32,
    /// Identifier the route manager attached to the table, if any.
    pub table_id: String,
}

impl RouteTable {
    pub fn new() -> Self {
        Self { entries: SymTab::new(), meids: SymTab::new(), updates: 0, table_id: String::new() }
    }

    /// Look up the entry for `(sub_id, mtype)`. A miss with a real
    /// subscription id is retried with the "any" id before giving up —
    /// callers that want the exact entry pass `allow_fallback = false`.
    pub fn get_rte(&self, sub_id: i32, mtype: i32, allow_fallback: bool) -> Option<Arc<RouteEntry>> {
        if let Some(rte) = self.entries.pull(build_key(sub_id, mtype)) {
            return Some(rte);
        }
        if allow_fallback && sub_id != UNSET_SUBID {
            return self.entries.pull(build_key(UNSET_SUBID, mtype));
        }
        None
    }

    /// Endpoint registered for a managed-element id, if any.
    pub fn meid_endpoint(&self, meid: &str) -> Option<Arc<Endpoint>> {
        self.meids.get(meid, MEID_SPACE)
    }

    /// Number of route entries in the table.
    pub fn entry_count(&self) -> usize {
        let mut n = 0;
        self.entries.foreach_numeric(|_, _| n += 1);
        n
    }

    pub(crate) fn insert(&mut self, entry: RouteEntry) {
        self.entries.map(entry.key, Arc::new(entry));
    }

    pub(crate) fn remove(&mut self, sub_id: i32, mtype: i32) {
        self.entries.ndel(build_key(sub_id, mtype));
    }

    pub(crate) fn map_meid(&mut self, meid: &str, ep: Arc<Endpoint>) {
        self.meids.put(meid, MEID_SPACE, ep);
    }

    pub(crate) fn unmap_meid(&mut self, meid: &str) {
        self.meids.del(meid, MEID_SPACE);
    }

    /// Flat summary of `(mtype, sub_id) -> groups of endpoint names`,
    /// ordered by key. Used by tests and the verbose table dump.
    pub fn summary(&self) -> Vec<((i32, i32), Vec<Vec<String>>)> {
        let mut out = Vec::new();
        self.entries.foreach_numeric(|_, rte| {
            let groups = rte
                .groups()
                .iter()
                .map(|g| g.endpoints().iter().map(|e| e.name().to_string()).collect())
                .collect();
            out.push(((rte.mtype, rte.sub_id), groups));
        });
        out.sort();
        out
    }
}

impl Clone for RouteTable {
    /// Clone for an `updatert` build: entries are shared (`Arc`), so the
    /// round-robin cursors of untouched entries keep rolling.
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            meids: self.meids.clone(),
            updates: self.updates,
            table_id: self.table_id.clone(),
        }
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint's counters as rendered into the periodic stat dump.
#[derive(Serialize)]
struct EpCount<'a> {
    endpoint: &'a str,
    sent: u64,
    send_failures: u64,
    received: u64,
}

/// Write the per-endpoint send/receive counters through the logger, one
/// line per endpoint. Human-readable by default; a JSON object per endpoint
/// when `hr` is false (RMR_HR_LOG=0).
pub fn dump_endpoint_counts(eps: &[Arc<Endpoint>], my_name: &str, hr: bool) {
    for ep in eps {
        let (sent, fails, received) = ep.counts();
        if hr {
            tracing::info!("{} endpoint {}: sent={} failed={} received={}", my_name, ep.name(), sent, fails, received);
        } else {
            let row = EpCount { endpoint: ep.name(), sent, send_failures: fails, received };
            match serde_json::to_string(&row) {
                Ok(json) => tracing::info!("{} epcount {}", my_name, json),
                Err(e) => tracing::warn!("epcount serialisation failed: {}", e),
            }
        }
    }
}
