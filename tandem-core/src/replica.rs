//! Local replica of a shared document.
//!
//! All mutation goes through [`Replica::apply`], tagged with an [`Origin`].
//! Observers register with a [`ListenFilter`]; an observer registered for
//! [`ListenFilter::Local`] is never invoked while a remote patch is being
//! applied, which is what keeps a remote edit from being re-broadcast.
//!
//! ```text
//!   local edit ──► apply(Local) ──► listeners(Local|All) ──► debouncer
//!   channel    ──► apply(Remote) ─► listeners(Remote|All) ─► UI
//!                        │
//!                        └──► baseline (remote changes are never pending)
//! ```
//!
//! The replica also keeps a *baseline*: the state last agreed with peers.
//! `pending_local()` is the diff between baseline and current records.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::patch::Patch;
use crate::record::{Record, RecordId};

/// Who authored a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,
    Remote,
}

/// Which mutations a listener wants to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenFilter {
    Local,
    Remote,
    All,
}

impl ListenFilter {
    pub fn accepts(self, origin: Origin) -> bool {
        match self {
            ListenFilter::All => true,
            ListenFilter::Local => origin == Origin::Local,
            ListenFilter::Remote => origin == Origin::Remote,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<R> = Box<dyn FnMut(&Patch<R>, Origin) + Send>;

/// Outcome counters of a single `apply`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// Entries that left the replica untouched (re-applied add/remove).
    pub unchanged: usize,
    /// `updated` entries whose id was missing and were inserted instead.
    pub promoted: usize,
}

impl ApplyReport {
    pub fn changed(&self) -> usize {
        self.added + self.updated + self.removed
    }
}

pub struct Replica<R: Record> {
    records: BTreeMap<RecordId, R>,
    baseline: BTreeMap<RecordId, R>,
    listeners: Vec<(ListenerId, ListenFilter, Listener<R>)>,
    next_listener: u64,
}

impl<R: Record> Default for Replica<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Record> fmt::Debug for Replica<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("records", &self.records.len())
            .field("baseline", &self.baseline.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl<R: Record> Replica<R> {
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            baseline: BTreeMap::new(),
            listeners: Vec::new(),
            next_listener: 0,
        }
    }

    /// Create a replica whose records and baseline both start at `records`.
    pub fn with_records(records: impl IntoIterator<Item = R>) -> Self {
        let mut replica = Self::new();
        replica.records = records
            .into_iter()
            .map(|r| (r.id().clone(), r))
            .collect();
        replica.baseline = replica.records.clone();
        replica
    }

    /// Apply `patch` with the given origin.
    ///
    /// - `added` inserts (or overwrites) the record.
    /// - `updated` sets the record to `to`; a missing id is inserted.
    /// - `removed` deletes the record if present.
    ///
    /// Re-applying an entry is a no-op. Listeners receive only the
    /// entries that actually changed the replica.
    pub fn apply(&mut self, patch: &Patch<R>, origin: Origin) -> ApplyReport {
        let mut report = ApplyReport::default();
        let mut effective = Patch::new();

        for (id, record) in &patch.added {
            self.put_record(id, record, &mut effective, &mut report);
        }

        for (id, (_, to)) in &patch.updated {
            if !self.records.contains_key(id) {
                log::debug!("Update for missing record {id} applied as insert");
                report.promoted += 1;
            }
            self.put_record(id, to, &mut effective, &mut report);
        }

        for id in patch.removed.keys() {
            match self.records.remove(id) {
                Some(previous) => {
                    report.removed += 1;
                    effective.removed.insert(id.clone(), previous);
                }
                None => report.unchanged += 1,
            }
        }

        if origin == Origin::Remote {
            merge_into(&mut self.baseline, patch);
        }

        if !effective.is_empty() {
            self.dispatch(&effective, origin);
        }

        report
    }

    fn put_record(
        &mut self,
        id: &RecordId,
        record: &R,
        effective: &mut Patch<R>,
        report: &mut ApplyReport,
    ) {
        match self.records.insert(id.clone(), record.clone()) {
            None => {
                report.added += 1;
                effective.added.insert(id.clone(), record.clone());
            }
            Some(previous) if previous == *record => {
                report.unchanged += 1;
            }
            Some(previous) => {
                report.updated += 1;
                effective.updated.insert(id.clone(), (previous, record.clone()));
            }
        }
    }

    fn dispatch(&mut self, effective: &Patch<R>, origin: Origin) {
        for (_, filter, listener) in self.listeners.iter_mut() {
            if filter.accepts(origin) {
                listener(effective, origin);
            }
        }
    }

    /// Insert or replace records as a local edit.
    pub fn put(&mut self, records: impl IntoIterator<Item = R>) -> ApplyReport {
        let mut patch = Patch::new();
        for record in records {
            patch = match self.records.get(record.id()) {
                Some(existing) if *existing == record => patch,
                Some(existing) => patch.with_updated(existing.clone(), record),
                None => patch.with_added(record),
            };
        }
        self.apply(&patch, Origin::Local)
    }

    /// Remove records as a local edit. Unknown ids are ignored.
    pub fn remove<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) -> ApplyReport {
        let mut patch = Patch::new();
        for id in ids {
            if let Some(existing) = self.records.get(id) {
                patch = patch.with_removed(existing.clone());
            }
        }
        self.apply(&patch, Origin::Local)
    }

    /// Register an observer. Returns an id for [`Replica::unlisten`].
    pub fn listen(
        &mut self,
        filter: ListenFilter,
        listener: impl FnMut(&Patch<R>, Origin) + Send + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, filter, Box::new(listener)));
        id
    }

    pub fn unlisten(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _, _)| *lid != id);
        self.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Capture the current records as the new baseline.
    pub fn commit_baseline(&mut self) {
        self.baseline = self.records.clone();
    }

    /// Local changes made since the last baseline commit.
    pub fn pending_local(&self) -> Patch<R> {
        Patch::diff(&self.baseline, &self.records)
    }

    /// Take pending local changes for emission and commit them.
    pub fn take_outbound(&mut self) -> Option<Patch<R>> {
        let patch = self.pending_local();
        if patch.is_empty() {
            return None;
        }
        self.commit_baseline();
        Some(patch)
    }

    /// Drop all records, baseline included. Listeners stay registered.
    pub fn reset(&mut self) {
        self.records.clear();
        self.baseline.clear();
    }

    pub fn get(&self, id: &str) -> Option<&R> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &BTreeMap<RecordId, R> {
        &self.records
    }

    pub fn baseline(&self) -> &BTreeMap<RecordId, R> {
        &self.baseline
    }

    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.records.values()
    }
}

/// Apply patch semantics to a bare map (used for the baseline).
fn merge_into<R: Record>(map: &mut BTreeMap<RecordId, R>, patch: &Patch<R>) {
    for (id, record) in &patch.added {
        map.insert(id.clone(), record.clone());
    }
    for (id, (_, to)) in &patch.updated {
        map.insert(id.clone(), to.clone());
    }
    for id in patch.removed.keys() {
        map.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Shape {
        id: RecordId,
        x: i64,
    }

    impl Record for Shape {
        fn id(&self) -> &RecordId {
            &self.id
        }
    }

    fn shape(id: &str, x: i64) -> Shape {
        Shape { id: RecordId::new(id), x }
    }

    fn added(records: &[Shape]) -> Patch<Shape> {
        records
            .iter()
            .cloned()
            .fold(Patch::new(), |patch, r| patch.with_added(r))
    }

    fn recorder(replica: &mut Replica<Shape>, filter: ListenFilter) -> Arc<Mutex<Vec<Origin>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        replica.listen(filter, move |_, origin| sink.lock().unwrap().push(origin));
        seen
    }

    #[test]
    fn test_apply_added_is_idempotent() {
        let mut replica = Replica::new();
        let patch = added(&[shape("id1", 1)]);

        let first = replica.apply(&patch, Origin::Remote);
        let second = replica.apply(&patch, Origin::Remote);

        assert_eq!(first.added, 1);
        assert_eq!(second.changed(), 0);
        assert_eq!(second.unchanged, 1);
        assert_eq!(replica.len(), 1);
    }

    #[test]
    fn test_apply_removed_is_idempotent() {
        let mut replica = Replica::with_records([shape("a", 1), shape("b", 2)]);
        let patch = Patch::new().with_removed(shape("a", 1));

        replica.apply(&patch, Origin::Remote);
        let snapshot = replica.records().clone();
        let again = replica.apply(&patch, Origin::Remote);

        assert_eq!(again.changed(), 0);
        assert_eq!(replica.records(), &snapshot);
        assert!(!replica.contains("a"));
    }

    #[test]
    fn test_apply_updated_twice_equals_once() {
        let mut once = Replica::with_records([shape("a", 1)]);
        let mut twice = Replica::with_records([shape("a", 1)]);
        let patch = Patch::new().with_updated(shape("a", 1), shape("a", 5));

        once.apply(&patch, Origin::Remote);
        twice.apply(&patch, Origin::Remote);
        twice.apply(&patch, Origin::Remote);

        assert_eq!(once.records(), twice.records());
        assert_eq!(twice.get("a"), Some(&shape("a", 5)));
    }

    #[test]
    fn test_update_for_missing_id_is_promoted_to_insert() {
        let mut replica = Replica::new();
        let patch = Patch::new().with_updated(shape("ghost", 1), shape("ghost", 2));

        let report = replica.apply(&patch, Origin::Remote);

        assert_eq!(report.promoted, 1);
        assert_eq!(report.added, 1);
        assert_eq!(replica.get("ghost"), Some(&shape("ghost", 2)));
    }

    #[test]
    fn test_disjoint_patches_commute() {
        let p1 = added(&[shape("a", 1)]).with_removed(shape("c", 3));
        let p2 = Patch::new().with_updated(shape("b", 2), shape("b", 20));

        let mut left = Replica::with_records([shape("b", 2), shape("c", 3)]);
        let mut right = Replica::with_records([shape("b", 2), shape("c", 3)]);

        left.apply(&p1, Origin::Remote);
        left.apply(&p2, Origin::Remote);
        right.apply(&p2, Origin::Remote);
        right.apply(&p1, Origin::Remote);

        assert_eq!(left.records(), right.records());
    }

    #[test]
    fn test_local_listener_never_sees_remote_apply() {
        let mut replica = Replica::new();
        let local = recorder(&mut replica, ListenFilter::Local);
        let all = recorder(&mut replica, ListenFilter::All);

        replica.apply(&added(&[shape("r", 1)]), Origin::Remote);
        replica.put([shape("l", 1)]);

        assert_eq!(*local.lock().unwrap(), vec![Origin::Local]);
        assert_eq!(*all.lock().unwrap(), vec![Origin::Remote, Origin::Local]);
    }

    #[test]
    fn test_listeners_not_called_for_no_op_apply() {
        let mut replica = Replica::with_records([shape("a", 1)]);
        let seen = recorder(&mut replica, ListenFilter::All);

        replica.put([shape("a", 1)]);
        replica.apply(&added(&[shape("a", 1)]), Origin::Remote);

        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unlisten() {
        let mut replica: Replica<Shape> = Replica::new();
        let id = replica.listen(ListenFilter::All, |_, _| {});
        assert_eq!(replica.listener_count(), 1);
        assert!(replica.unlisten(id));
        assert!(!replica.unlisten(id));
        assert_eq!(replica.listener_count(), 0);
    }

    #[test]
    fn test_remote_changes_are_not_pending() {
        let mut replica = Replica::new();
        replica.apply(&added(&[shape("a", 1)]), Origin::Remote);
        assert!(replica.pending_local().is_empty());

        replica.put([shape("a", 2)]);
        let pending = replica.pending_local();
        assert_eq!(pending.updated.get("a"), Some(&(shape("a", 1), shape("a", 2))));
    }

    #[test]
    fn test_remote_overwrite_clears_matching_pending_change() {
        let mut replica = Replica::with_records([shape("a", 1)]);
        replica.put([shape("a", 2)]);

        replica.apply(
            &Patch::new().with_updated(shape("a", 1), shape("a", 2)),
            Origin::Remote,
        );

        assert!(replica.pending_local().is_empty());
    }

    #[test]
    fn test_take_outbound_commits() {
        let mut replica = Replica::new();
        replica.put([shape("a", 1)]);

        let out = replica.take_outbound().unwrap();
        assert_eq!(out.added.len(), 1);
        assert!(replica.take_outbound().is_none());
    }

    #[test]
    fn test_local_remove_ignores_unknown_ids() {
        let mut replica = Replica::with_records([shape("a", 1)]);
        let report = replica.remove(["a", "missing"]);
        assert_eq!(report.removed, 1);
        assert!(replica.is_empty());
    }

    #[test]
    fn test_two_clients_converge_on_last_writer() {
        // A adds id1; B receives it, edits locally and sends the diff back.
        let mut a: Replica<Shape> = Replica::new();
        let mut b: Replica<Shape> = Replica::new();

        a.put([shape("id1", 1)]);
        let from_a = a.take_outbound().unwrap();
        b.apply(&from_a, Origin::Remote);

        b.put([shape("id1", 2)]);
        let from_b = b.take_outbound().unwrap();
        assert_eq!(from_b.updated.get("id1"), Some(&(shape("id1", 1), shape("id1", 2))));

        a.apply(&from_b, Origin::Remote);

        assert_eq!(a.records(), b.records());
        assert_eq!(a.get("id1"), Some(&shape("id1", 2)));
        assert_eq!(
            serde_json::to_string(a.records()).unwrap(),
            serde_json::to_string(b.records()).unwrap()
        );
    }

    #[test]
    fn test_same_patch_sequence_converges() {
        let patches = vec![
            added(&[shape("a", 1), shape("b", 1)]),
            Patch::new().with_updated(shape("a", 1), shape("a", 3)),
            Patch::new().with_removed(shape("b", 1)),
            added(&[shape("c", 7)]),
        ];

        let mut left: Replica<Shape> = Replica::new();
        let mut right: Replica<Shape> = Replica::new();
        for p in &patches {
            left.apply(p, Origin::Remote);
            right.apply(p, Origin::Remote);
            right.apply(p, Origin::Remote);
        }

        assert_eq!(
            serde_json::to_vec(left.records()).unwrap(),
            serde_json::to_vec(right.records()).unwrap()
        );
    }
}
