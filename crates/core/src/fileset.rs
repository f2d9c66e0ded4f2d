//! The per-repository file-set store.
//!
//! A [FileSet] holds one view per node: the record list that node has
//! reported for the repository. The view under the owning node's own id
//! is the local view, fed by the scanner and the pull engine. The global
//! record for a name is the supremum across all views under the
//! version/originator ordering, and the need list is the set of global
//! records that supersede what the local view holds.

use std::collections::{BTreeMap, HashMap};
use weft_api::{supersedes, FileRecord, NodeId, RepoId};

/// Per-repository mapping `NodeId -> (name -> FileRecord)`.
#[derive(Debug)]
pub struct FileSet {
    repo: RepoId,
    self_id: NodeId,
    views: HashMap<NodeId, BTreeMap<String, FileRecord>>,
    local_sequence: u64,
}

impl FileSet {
    /// Construct an empty store for one repository.
    pub fn new(repo: RepoId, self_id: NodeId) -> Self {
        let mut views = HashMap::new();
        views.insert(self_id.clone(), BTreeMap::new());
        Self {
            repo,
            self_id,
            views,
            local_sequence: 0,
        }
    }

    /// The repository this store belongs to.
    pub fn repo(&self) -> &RepoId {
        &self.repo
    }

    /// The highest receive sequence assigned to the local view so far.
    pub fn local_sequence(&self) -> u64 {
        self.local_sequence
    }

    fn local_view(&self) -> &BTreeMap<String, FileRecord> {
        self.views
            .get(&self.self_id)
            .expect("local view always present")
    }

    /// The local record for a name, if any.
    pub fn local(&self, name: &str) -> Option<&FileRecord> {
        self.local_view().get(name)
    }

    /// Iterate the local view.
    pub fn local_records(&self) -> impl Iterator<Item = &FileRecord> {
        self.local_view().values()
    }

    /// Clone the local view into a map, for handing to the scanner.
    pub fn local_snapshot(&self) -> HashMap<String, FileRecord> {
        self.local_view()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Insert a record into the local view, assigning it the next receive
    /// sequence.
    pub fn apply_local_change(&mut self, mut record: FileRecord) {
        self.local_sequence += 1;
        record.local_version = self.local_sequence;
        self.views
            .get_mut(&self.self_id)
            .expect("local view always present")
            .insert(record.name.clone(), record);
    }

    /// Restore the local view from a persisted snapshot. The receive
    /// sequence resumes past the highest restored value.
    pub fn restore_local(&mut self, records: Vec<FileRecord>) {
        let view = self
            .views
            .get_mut(&self.self_id)
            .expect("local view always present");
        for record in records {
            self.local_sequence = self.local_sequence.max(record.local_version);
            view.insert(record.name.clone(), record);
        }
    }

    /// Replace a peer's whole view (initial `Index`).
    pub fn replace_peer_view(&mut self, peer: &NodeId, records: Vec<FileRecord>) {
        let view = self.views.entry(peer.clone()).or_default();
        view.clear();
        for record in records {
            view.insert(record.name.clone(), record);
        }
    }

    /// Merge records into a peer's view (`IndexUpdate`). Applying the
    /// same update twice yields the same state as applying it once.
    pub fn merge_peer_view(&mut self, peer: &NodeId, records: Vec<FileRecord>) {
        let view = self.views.entry(peer.clone()).or_default();
        for record in records {
            view.insert(record.name.clone(), record);
        }
    }

    /// The global record for a name: the supremum across every view.
    ///
    /// Disconnected peers' views stay in the store deliberately: their
    /// records remain valid knowledge, they are just not fetchable until
    /// the peer returns.
    pub fn global(&self, name: &str) -> Option<(&NodeId, &FileRecord)> {
        let mut best: Option<(&NodeId, &FileRecord)> = None;
        for (node, view) in self.views.iter() {
            if let Some(record) = view.get(name) {
                best = match best {
                    None => Some((node, record)),
                    Some((bn, br)) => {
                        if supersedes(node, record, bn, br) {
                            Some((node, record))
                        } else {
                            Some((bn, br))
                        }
                    }
                };
            }
        }
        best
    }

    /// The need list: global records that supersede the local view's
    /// record for the same name.
    ///
    /// Deleted globals with no local counterpart need nothing, and
    /// invalid records are never candidates — a node that could not read
    /// a file has nothing to offer for it.
    pub fn need(&self) -> Vec<FileRecord> {
        let mut names: Vec<&str> = Vec::new();
        for (node, view) in self.views.iter() {
            if *node == self.self_id {
                continue;
            }
            names.extend(view.keys().map(|k| k.as_str()));
        }
        names.sort_unstable();
        names.dedup();

        let mut out = Vec::new();
        for name in names {
            let (gn, gr) = match self.global(name) {
                Some(g) => g,
                None => continue,
            };
            if gr.is_invalid() {
                continue;
            }
            match self.local(name) {
                Some(local) => {
                    if gr.wire_eq(local) {
                        continue;
                    }
                    if supersedes(gn, gr, &self.self_id, local) {
                        out.push(gr.clone());
                    }
                }
                None => {
                    if !gr.is_deleted() {
                        out.push(gr.clone());
                    }
                }
            }
        }
        out.sort_by_key(|r| r.version);
        out
    }

    /// Whether `name` is currently on the need list.
    pub fn needs(&self, name: &str) -> bool {
        let (gn, gr) = match self.global(name) {
            Some(g) => g,
            None => return false,
        };
        if gr.is_invalid() {
            return false;
        }
        match self.local(name) {
            Some(local) => {
                !gr.wire_eq(local)
                    && supersedes(gn, gr, &self.self_id, local)
            }
            None => !gr.is_deleted(),
        }
    }

    /// The peers (never self) whose view holds exactly `target` for its
    /// name, i.e. the nodes blocks can be requested from.
    pub fn availability(&self, target: &FileRecord) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .views
            .iter()
            .filter(|(node, _)| **node != self.self_id)
            .filter(|(_, view)| {
                view.get(&target.name)
                    .map(|r| r.wire_eq(target))
                    .unwrap_or(false)
            })
            .map(|(node, _)| node.clone())
            .collect();
        out.sort();
        out
    }

    /// Local records whose receive sequence exceeds `watermark`, in
    /// sequence order. This is the delta an `IndexUpdate` carries.
    pub fn changes_since(&self, watermark: u64) -> Vec<FileRecord> {
        let mut out: Vec<FileRecord> = self
            .local_view()
            .values()
            .filter(|r| r.local_version > watermark)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.local_version);
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use weft_api::FLAG_DELETED;

    fn rec(name: &str, version: u64) -> FileRecord {
        FileRecord {
            name: name.into(),
            version,
            ..Default::default()
        }
    }

    fn store() -> FileSet {
        FileSet::new("default".into(), "SELF".into())
    }

    #[test]
    fn global_is_supremum_across_views() {
        let mut fs = store();
        fs.apply_local_change(rec("a", 1));
        fs.merge_peer_view(&"PEER".into(), vec![rec("a", 2)]);

        let (node, record) = fs.global("a").unwrap();
        assert_eq!(&NodeId::from("PEER"), node);
        assert_eq!(2, record.version);
    }

    #[test]
    fn need_lists_superseding_records_only() {
        let mut fs = store();
        fs.apply_local_change(rec("a", 5));
        fs.merge_peer_view(
            &"PEER".into(),
            vec![rec("a", 3), rec("b", 1)],
        );

        let need = fs.need();
        assert_eq!(1, need.len());
        assert_eq!("b", need[0].name);
        assert!(fs.needs("b"));
        assert!(!fs.needs("a"));
    }

    #[test]
    fn equal_version_ties_break_on_node_id() {
        // Two conflicting edits at the same version: the record reported
        // by the lexicographically lower node wins everywhere.
        let mut fs = FileSet::new("default".into(), "MMMM".into());
        let mut mine = rec("a", 7);
        mine.modified = 1;
        fs.apply_local_change(mine);
        let mut theirs = rec("a", 7);
        theirs.modified = 2;
        fs.merge_peer_view(&"AAAA".into(), vec![theirs]);

        assert!(fs.needs("a"));
        let (node, _) = fs.global("a").unwrap();
        assert_eq!(&NodeId::from("AAAA"), node);

        // And the reverse: a higher peer id loses the tie.
        let mut fs = FileSet::new("default".into(), "MMMM".into());
        let mut mine = rec("a", 7);
        mine.modified = 1;
        fs.apply_local_change(mine);
        let mut theirs = rec("a", 7);
        theirs.modified = 2;
        fs.merge_peer_view(&"ZZZZ".into(), vec![theirs]);
        assert!(!fs.needs("a"));
    }

    #[test]
    fn adopted_record_leaves_the_need_list() {
        let mut fs = store();
        fs.merge_peer_view(&"AAAA".into(), vec![rec("a", 7)]);
        assert!(fs.needs("a"));

        // Pull completion adopts the winning record verbatim.
        fs.apply_local_change(rec("a", 7));
        assert!(!fs.needs("a"));
        assert!(fs.need().is_empty());
    }

    #[test]
    fn deleted_global_without_local_needs_nothing() {
        let mut fs = store();
        let mut gone = rec("a", 2);
        gone.flags |= FLAG_DELETED;
        fs.merge_peer_view(&"PEER".into(), vec![gone.clone()]);
        assert!(!fs.needs("a"));

        // With a local record present the deletion must be applied.
        fs.apply_local_change(rec("a", 1));
        assert!(fs.needs("a"));
    }

    #[test]
    fn merge_is_idempotent() {
        let mut fs = store();
        let update = vec![rec("a", 1), rec("b", 2)];
        fs.merge_peer_view(&"PEER".into(), update.clone());
        let need_once = fs.need();
        fs.merge_peer_view(&"PEER".into(), update);
        assert_eq!(need_once, fs.need());
    }

    #[test]
    fn replace_clears_stale_entries() {
        let mut fs = store();
        fs.merge_peer_view(&"PEER".into(), vec![rec("stale", 1)]);
        fs.replace_peer_view(&"PEER".into(), vec![rec("fresh", 1)]);
        assert!(!fs.needs("stale"));
        assert!(fs.needs("fresh"));
    }

    #[test]
    fn changes_since_watermark() {
        let mut fs = store();
        fs.apply_local_change(rec("a", 1));
        fs.apply_local_change(rec("b", 2));
        fs.apply_local_change(rec("c", 3));

        let all = fs.changes_since(0);
        assert_eq!(3, all.len());
        assert_eq!(
            vec!["a", "b", "c"],
            all.iter().map(|r| r.name.as_str()).collect::<Vec<_>>()
        );

        let tail = fs.changes_since(all[1].local_version);
        assert_eq!(1, tail.len());
        assert_eq!("c", tail[0].name);

        assert!(fs.changes_since(fs.local_sequence()).is_empty());
    }

    #[test]
    fn availability_matches_exact_record() {
        let mut fs = store();
        let target = rec("a", 5);
        fs.merge_peer_view(&"P1".into(), vec![target.clone()]);
        fs.merge_peer_view(&"P2".into(), vec![rec("a", 4)]);
        fs.merge_peer_view(&"P3".into(), vec![target.clone()]);

        assert_eq!(
            vec![NodeId::from("P1"), NodeId::from("P3")],
            fs.availability(&target)
        );
    }

    #[test]
    fn restore_resumes_sequence() {
        let mut fs = store();
        fs.apply_local_change(rec("a", 1));
        fs.apply_local_change(rec("b", 2));
        let saved: Vec<FileRecord> =
            fs.local_records().cloned().collect();

        let mut fs = store();
        fs.restore_local(saved);
        assert_eq!(2, fs.local_sequence());
        fs.apply_local_change(rec("c", 3));
        assert_eq!(3, fs.local("c").unwrap().local_version);
    }
}
