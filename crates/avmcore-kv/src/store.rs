//! Copy-on-write store, snapshots, and write transactions.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::column::Column;

type Family = BTreeMap<Vec<u8>, Vec<u8>>;
/// Overlay entry: `Some` = pending put, `None` = pending delete.
type Overlay = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// All families at one point in time. Families are `Arc`-shared between the
/// live store and outstanding snapshots; a commit clones only the families
/// it touched.
#[derive(Clone, Default)]
struct Families {
    families: [Arc<Family>; Column::COUNT],
}

impl Families {
    fn family(&self, col: Column) -> &Family {
        &self.families[col.index()]
    }
}

/// Uniform read interface over snapshots and in-flight transactions.
///
/// Iteration order is the byte order of keys. Reverse seeks are inclusive of
/// the given key, matching the `SeekForPrev` contract the core relies on.
pub trait ReadView {
    /// Point lookup.
    fn get(&self, col: Column, key: &[u8]) -> Option<Vec<u8>>;

    /// Ascending iteration from `start` (inclusive).
    fn iter_from<'a>(
        &'a self,
        col: Column,
        start: &[u8],
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

    /// Descending iteration from `upto` (inclusive), or from the last entry
    /// when `upto` is `None`.
    fn iter_rev<'a>(
        &'a self,
        col: Column,
        upto: Option<&[u8]>,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

    /// Greatest entry with key ≤ `key`.
    fn seek_for_prev(&self, col: Column, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.iter_rev(col, Some(key)).next()
    }

    /// Last entry of the family.
    fn last(&self, col: Column) -> Option<(Vec<u8>, Vec<u8>)> {
        self.iter_rev(col, None).next()
    }
}

fn family_iter_from<'a>(
    family: &'a Family,
    start: &[u8],
) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
    Box::new(
        family
            .range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
            .map(|(k, v)| (k.clone(), v.clone())),
    )
}

fn family_iter_rev<'a>(
    family: &'a Family,
    upto: Option<&[u8]>,
) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
    let range = match upto {
        Some(upto) => family.range::<[u8], _>((Bound::Unbounded, Bound::Included(upto))),
        None => family.range::<[u8], _>(..),
    };
    Box::new(range.rev().map(|(k, v)| (k.clone(), v.clone())))
}

// ---------------------------------------------------------------------------
// KvStore
// ---------------------------------------------------------------------------

/// The live store. Readers take [`Snapshot`]s (an `Arc` clone per family);
/// the single writer stages changes in a [`WriteTx`] and publishes them
/// atomically on commit.
#[derive(Default)]
pub struct KvStore {
    current: RwLock<Families>,
}

impl KvStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A consistent view of every family as of now.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            families: self.current.read().clone(),
        }
    }

    /// Begin a read-write transaction against the current state.
    ///
    /// The transaction reads its own writes; nothing is visible to other
    /// readers until [`WriteTx::commit`].
    #[must_use]
    pub fn begin(&self) -> WriteTx<'_> {
        WriteTx {
            store: self,
            base: self.snapshot(),
            overlay: Default::default(),
        }
    }

    fn apply(&self, overlay: [Overlay; Column::COUNT]) {
        let mut current = self.current.write();
        for (idx, ops) in overlay.into_iter().enumerate() {
            if ops.is_empty() {
                continue;
            }
            let family = Arc::make_mut(&mut current.families[idx]);
            for (key, op) in ops {
                match op {
                    Some(value) => {
                        family.insert(key, value);
                    }
                    None => {
                        family.remove(&key);
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// An immutable, consistent view of the whole store.
#[derive(Clone)]
pub struct Snapshot {
    families: Families,
}

impl ReadView for Snapshot {
    fn get(&self, col: Column, key: &[u8]) -> Option<Vec<u8>> {
        self.families.family(col).get(key).cloned()
    }

    fn iter_from<'a>(
        &'a self,
        col: Column,
        start: &[u8],
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        family_iter_from(self.families.family(col), start)
    }

    fn iter_rev<'a>(
        &'a self,
        col: Column,
        upto: Option<&[u8]>,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        family_iter_rev(self.families.family(col), upto)
    }
}

// ---------------------------------------------------------------------------
// WriteTx
// ---------------------------------------------------------------------------

/// A read-write transaction: a snapshot base plus a tombstoned overlay.
///
/// Reads and iteration merge the overlay over the base, so the transaction
/// observes its own puts and deletes. Dropping the transaction discards the
/// overlay; committing applies it atomically.
pub struct WriteTx<'s> {
    store: &'s KvStore,
    base: Snapshot,
    overlay: [Overlay; Column::COUNT],
}

impl WriteTx<'_> {
    pub fn put(&mut self, col: Column, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.overlay[col.index()].insert(key.into(), Some(value.into()));
    }

    pub fn delete(&mut self, col: Column, key: impl Into<Vec<u8>>) {
        self.overlay[col.index()].insert(key.into(), None);
    }

    /// Publish every staged operation in one atomic step.
    pub fn commit(self) {
        self.store.apply(self.overlay);
    }

    fn merged<'a>(
        &'a self,
        base: Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>,
        overlay: Box<dyn Iterator<Item = (&'a Vec<u8>, &'a Option<Vec<u8>>)> + 'a>,
        reverse: bool,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        Box::new(MergedIter {
            base: base.peekable(),
            overlay: overlay.peekable(),
            reverse,
        })
    }
}

impl ReadView for WriteTx<'_> {
    fn get(&self, col: Column, key: &[u8]) -> Option<Vec<u8>> {
        match self.overlay[col.index()].get(key) {
            Some(Some(value)) => Some(value.clone()),
            Some(None) => None,
            None => self.base.get(col, key),
        }
    }

    fn iter_from<'a>(
        &'a self,
        col: Column,
        start: &[u8],
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        let base = self.base.iter_from(col, start);
        let overlay = self.overlay[col.index()]
            .range::<[u8], _>((Bound::Included(start), Bound::Unbounded));
        self.merged(base, Box::new(overlay), false)
    }

    fn iter_rev<'a>(
        &'a self,
        col: Column,
        upto: Option<&[u8]>,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        let base = self.base.iter_rev(col, upto);
        let ops = &self.overlay[col.index()];
        let overlay: Box<dyn Iterator<Item = _> + '_> = match upto {
            Some(upto) => Box::new(
                ops.range::<[u8], _>((Bound::Unbounded, Bound::Included(upto)))
                    .rev(),
            ),
            None => Box::new(ops.range::<[u8], _>(..).rev()),
        };
        self.merged(base, overlay, true)
    }
}

/// Two-way merge of the base iterator and the overlay, overlay winning on
/// equal keys and tombstones suppressing base entries.
struct MergedIter<'a, B, O>
where
    B: Iterator<Item = (Vec<u8>, Vec<u8>)>,
    O: Iterator<Item = (&'a Vec<u8>, &'a Option<Vec<u8>>)>,
{
    base: std::iter::Peekable<B>,
    overlay: std::iter::Peekable<O>,
    reverse: bool,
}

impl<'a, B, O> Iterator for MergedIter<'a, B, O>
where
    B: Iterator<Item = (Vec<u8>, Vec<u8>)>,
    O: Iterator<Item = (&'a Vec<u8>, &'a Option<Vec<u8>>)>,
{
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let take_overlay = match (self.base.peek(), self.overlay.peek()) {
                (None, None) => return None,
                (Some(_), None) => false,
                (None, Some(_)) => true,
                (Some((bk, _)), Some((ok, _))) => {
                    if bk == *ok {
                        // Overlay shadows the base entry.
                        self.base.next();
                        true
                    } else if self.reverse {
                        *ok > bk
                    } else {
                        *ok < bk
                    }
                }
            };
            if take_overlay {
                let (key, op) = self.overlay.next().expect("peeked");
                match op {
                    Some(value) => return Some((key.clone(), value.clone())),
                    None => continue, // tombstone
                }
            }
            return self.base.next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(iter: impl Iterator<Item = (Vec<u8>, Vec<u8>)>) -> Vec<(Vec<u8>, Vec<u8>)> {
        iter.collect()
    }

    fn seeded_store() -> KvStore {
        let store = KvStore::new();
        let mut tx = store.begin();
        for i in [1u8, 3, 5, 7] {
            tx.put(Column::Log, vec![i], vec![i * 10]);
        }
        tx.commit();
        store
    }

    #[test]
    fn snapshot_isolated_from_later_commits() {
        let store = seeded_store();
        let snap = store.snapshot();

        let mut tx = store.begin();
        tx.put(Column::Log, vec![9], vec![90]);
        tx.delete(Column::Log, vec![1]);
        tx.commit();

        assert_eq!(snap.get(Column::Log, &[1]), Some(vec![10]));
        assert_eq!(snap.get(Column::Log, &[9]), None);
        let fresh = store.snapshot();
        assert_eq!(fresh.get(Column::Log, &[1]), None);
        assert_eq!(fresh.get(Column::Log, &[9]), Some(vec![90]));
    }

    #[test]
    fn uncommitted_tx_is_invisible() {
        let store = seeded_store();
        {
            let mut tx = store.begin();
            tx.put(Column::Log, vec![2], vec![20]);
            // Dropped without commit.
        }
        assert_eq!(store.snapshot().get(Column::Log, &[2]), None);
    }

    #[test]
    fn tx_reads_own_writes() {
        let store = seeded_store();
        let mut tx = store.begin();
        tx.put(Column::Log, vec![4], vec![40]);
        tx.delete(Column::Log, vec![3]);
        assert_eq!(tx.get(Column::Log, &[4]), Some(vec![40]));
        assert_eq!(tx.get(Column::Log, &[3]), None);
        assert_eq!(tx.get(Column::Log, &[5]), Some(vec![50]));
    }

    #[test]
    fn merged_forward_iteration() {
        let store = seeded_store();
        let mut tx = store.begin();
        tx.put(Column::Log, vec![4], vec![40]);
        tx.put(Column::Log, vec![5], vec![55]); // shadows base
        tx.delete(Column::Log, vec![7]);

        let keys: Vec<_> = collect(tx.iter_from(Column::Log, &[2]))
            .into_iter()
            .collect();
        assert_eq!(
            keys,
            vec![
                (vec![3], vec![30]),
                (vec![4], vec![40]),
                (vec![5], vec![55]),
            ]
        );
    }

    #[test]
    fn merged_reverse_iteration() {
        let store = seeded_store();
        let mut tx = store.begin();
        tx.put(Column::Log, vec![6], vec![60]);
        tx.delete(Column::Log, vec![5]);

        let keys: Vec<_> = collect(tx.iter_rev(Column::Log, Some(&[6])));
        assert_eq!(
            keys,
            vec![
                (vec![6], vec![60]),
                (vec![3], vec![30]),
                (vec![1], vec![10]),
            ]
        );
    }

    #[test]
    fn seek_for_prev_is_inclusive() {
        let store = seeded_store();
        let snap = store.snapshot();
        assert_eq!(
            snap.seek_for_prev(Column::Log, &[5]),
            Some((vec![5], vec![50]))
        );
        assert_eq!(
            snap.seek_for_prev(Column::Log, &[4]),
            Some((vec![3], vec![30]))
        );
        assert_eq!(snap.seek_for_prev(Column::Log, &[0]), None);
        assert_eq!(snap.last(Column::Log), Some((vec![7], vec![70])));
    }

    #[test]
    fn families_are_independent() {
        let store = seeded_store();
        let mut tx = store.begin();
        tx.put(Column::Send, vec![1], vec![99]);
        tx.commit();
        let snap = store.snapshot();
        assert_eq!(snap.get(Column::Log, &[1]), Some(vec![10]));
        assert_eq!(snap.get(Column::Send, &[1]), Some(vec![99]));
        assert_eq!(snap.get(Column::State, &[1]), None);
    }

    #[test]
    fn empty_store_iterates_empty() {
        let store = KvStore::new();
        let snap = store.snapshot();
        assert!(snap.iter_from(Column::Checkpoint, &[]).next().is_none());
        assert!(snap.last(Column::Checkpoint).is_none());
    }
}
