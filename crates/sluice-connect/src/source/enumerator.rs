//! Split enumerator
//!
//! Discovers splits through a [`SplitDiscovery`] and hands them to reader
//! instances with a reproducible policy. The assignment map is part of the
//! checkpoint so a restored enumerator never hands out the same split twice.
//!
//! ```text
//! Initializing -> Discovering -> Assigning -> Draining   (bounded, all handed out)
//!                      ^              |     -> Idle       (waiting for more splits)
//!                      +--------------+
//! any -> Closed
//! ```

use super::split::{Boundedness, ReaderId, SourceSplit};
use crate::error::{ConnectorError, ConnectorResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

/// Splits handed to readers in one step
pub type Assignments<S> = BTreeMap<ReaderId, Vec<S>>;

/// Lists units of work in the external system
#[async_trait]
pub trait SplitDiscovery<S: SourceSplit>: Send + Sync {
    /// Next batch of splits. Bounded sources are asked once; unbounded ones
    /// are polled repeatedly and may return splits already seen.
    async fn discover(&mut self) -> ConnectorResult<Vec<S>>;

    fn boundedness(&self) -> Boundedness;
}

/// Discovery for sources with one unit of work
#[derive(Debug, Clone)]
pub struct SingleSplitDiscovery<S> {
    split: S,
}

impl<S> SingleSplitDiscovery<S> {
    pub fn new(split: S) -> Self {
        Self { split }
    }
}

#[async_trait]
impl<S: SourceSplit> SplitDiscovery<S> for SingleSplitDiscovery<S> {
    async fn discover(&mut self) -> ConnectorResult<Vec<S>> {
        Ok(vec![self.split.clone()])
    }

    fn boundedness(&self) -> Boundedness {
        Boundedness::Bounded
    }
}

/// Lifecycle of an enumerator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnumeratorPhase {
    Initializing,
    Discovering,
    Assigning,
    /// Bounded source with every split handed out
    Draining,
    /// Waiting for the next discovery round
    Idle,
    Closed,
}

impl fmt::Display for EnumeratorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnumeratorPhase::Initializing => "initializing",
            EnumeratorPhase::Discovering => "discovering",
            EnumeratorPhase::Assigning => "assigning",
            EnumeratorPhase::Draining => "draining",
            EnumeratorPhase::Idle => "idle",
            EnumeratorPhase::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Policy for choosing a split's owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    /// Cycle through readers in discovery order
    #[default]
    RoundRobin,
    /// Stable hash of the split id
    Hash,
    /// Every split goes to reader 0
    FirstReader,
}

/// Persisted enumerator checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: SourceSplit")]
pub struct EnumeratorState<S> {
    pub checkpoint_id: u64,
    /// split id -> (owner, split) for splits already handed to a reader
    pub assigned: BTreeMap<String, (ReaderId, S)>,
    /// Owner-resolved splits waiting for their reader to register
    pub pending: BTreeMap<String, (ReaderId, S)>,
    pub discovery_finished: bool,
    pub round_robin_cursor: u64,
}

/// Stable 64-bit FNV-1a; `DefaultHasher` output is not guaranteed across releases
fn stable_hash(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in s.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Assigns discovered splits to a fixed set of readers
pub struct SplitEnumerator<S: SourceSplit> {
    discovery: Box<dyn SplitDiscovery<S>>,
    num_readers: u32,
    strategy: AssignmentStrategy,
    phase: EnumeratorPhase,
    registered: BTreeSet<ReaderId>,
    assigned: BTreeMap<String, (ReaderId, S)>,
    pending: BTreeMap<String, (ReaderId, S)>,
    discovery_finished: bool,
    round_robin_cursor: u64,
}

impl<S: SourceSplit> fmt::Debug for SplitEnumerator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitEnumerator")
            .field("num_readers", &self.num_readers)
            .field("strategy", &self.strategy)
            .field("phase", &self.phase)
            .field("assigned", &self.assigned.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl<S: SourceSplit> SplitEnumerator<S> {
    pub fn new(
        discovery: Box<dyn SplitDiscovery<S>>,
        num_readers: u32,
        strategy: AssignmentStrategy,
    ) -> ConnectorResult<Self> {
        if num_readers == 0 {
            return Err(ConnectorError::config("enumerator needs at least one reader"));
        }
        Ok(Self {
            discovery,
            num_readers,
            strategy,
            phase: EnumeratorPhase::Initializing,
            registered: BTreeSet::new(),
            assigned: BTreeMap::new(),
            pending: BTreeMap::new(),
            discovery_finished: false,
            round_robin_cursor: 0,
        })
    }

    /// Rehydrate from a checkpoint.
    ///
    /// Bounded sources whose discovery had finished do not discover again.
    /// After a parallelism decrease, splits owned by readers that no longer
    /// exist, assigned or pending, are re-homed to live readers and handed out
    /// again on registration. Their read positions live in the removed
    /// readers' state; the new owner starts from whatever position it is given
    /// with the split.
    pub fn restore(
        discovery: Box<dyn SplitDiscovery<S>>,
        num_readers: u32,
        strategy: AssignmentStrategy,
        state: EnumeratorState<S>,
    ) -> ConnectorResult<Self> {
        let mut enumerator = Self::new(discovery, num_readers, strategy)?;
        info!(
            checkpoint_id = state.checkpoint_id,
            assigned = state.assigned.len(),
            pending = state.pending.len(),
            "Restoring split enumerator"
        );
        enumerator.assigned = state.assigned;
        enumerator.pending = state.pending;
        enumerator.round_robin_cursor = state.round_robin_cursor;
        enumerator.discovery_finished = state.discovery_finished
            && enumerator.discovery.boundedness() == Boundedness::Bounded;
        // readers beyond the current parallelism lose their splits to live readers
        let orphaned: Vec<String> = enumerator
            .assigned
            .iter()
            .chain(enumerator.pending.iter())
            .filter(|(_, (owner, _))| owner.0 >= num_readers)
            .map(|(id, _)| id.clone())
            .collect();
        if !orphaned.is_empty() {
            warn!(count = orphaned.len(), num_readers, "Re-homing splits of removed readers");
        }
        for id in orphaned {
            let entry = enumerator
                .assigned
                .remove(&id)
                .or_else(|| enumerator.pending.remove(&id));
            if let Some((_, split)) = entry {
                let owner = enumerator.owner_for(&id);
                enumerator.pending.insert(id, (owner, split));
            }
        }
        Ok(enumerator)
    }

    pub fn phase(&self) -> EnumeratorPhase {
        self.phase
    }

    pub fn boundedness(&self) -> Boundedness {
        self.discovery.boundedness()
    }

    fn set_phase(&mut self, phase: EnumeratorPhase) {
        if self.phase != phase {
            debug!(from = %self.phase, to = %phase, "Enumerator phase change");
            self.phase = phase;
        }
    }

    fn ensure_open(&self) -> ConnectorResult<()> {
        if self.phase == EnumeratorPhase::Closed {
            return Err(ConnectorError::state("split enumerator is closed"));
        }
        Ok(())
    }

    fn owner_for(&mut self, split_id: &str) -> ReaderId {
        match self.strategy {
            AssignmentStrategy::RoundRobin => {
                let owner = (self.round_robin_cursor % u64::from(self.num_readers)) as u32;
                self.round_robin_cursor += 1;
                ReaderId(owner)
            }
            AssignmentStrategy::Hash => {
                ReaderId((stable_hash(split_id) % u64::from(self.num_readers)) as u32)
            }
            AssignmentStrategy::FirstReader => ReaderId(0),
        }
    }

    /// Owner of a split, if it has been assigned or is waiting for its reader
    pub fn owner_of(&self, split_id: &str) -> Option<ReaderId> {
        self.assigned
            .get(split_id)
            .or_else(|| self.pending.get(split_id))
            .map(|(owner, _)| *owner)
    }

    /// Record that `split` belongs to `reader`.
    ///
    /// Returns `false` when the split is already assigned to that reader.
    pub fn assign(&mut self, split: S, reader: ReaderId) -> ConnectorResult<bool> {
        self.ensure_open()?;
        let id = split.split_id();
        if let Some((owner, _)) = self.assigned.get(&id) {
            if *owner == reader {
                return Ok(false);
            }
            return Err(ConnectorError::state(format!(
                "split '{}' is already assigned to {}",
                id, owner
            )));
        }
        self.pending.remove(&id);
        self.assigned.insert(id, (reader, split));
        Ok(true)
    }

    /// Discover new splits and return what can be handed out now.
    pub async fn discover_and_assign(&mut self) -> ConnectorResult<Assignments<S>> {
        self.ensure_open()?;

        if !self.discovery_finished {
            self.set_phase(EnumeratorPhase::Discovering);
            let discovered = self.discovery.discover().await?;
            let mut fresh = 0usize;
            for split in discovered {
                let id = split.split_id();
                if self.assigned.contains_key(&id) || self.pending.contains_key(&id) {
                    continue;
                }
                let owner = self.owner_for(&id);
                self.pending.insert(id, (owner, split));
                fresh += 1;
            }
            debug!(fresh, "Discovered splits");
            if self.discovery.boundedness() == Boundedness::Bounded {
                self.discovery_finished = true;
            }
        }

        self.set_phase(EnumeratorPhase::Assigning);
        let readers: Vec<ReaderId> = self.registered.iter().copied().collect();
        let mut out = Assignments::new();
        for reader in readers {
            let splits = self.take_pending_for(reader);
            if !splits.is_empty() {
                out.insert(reader, splits);
            }
        }
        self.settle();
        Ok(out)
    }

    fn take_pending_for(&mut self, reader: ReaderId) -> Vec<S> {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, (owner, _))| *owner == reader)
            .map(|(id, _)| id.clone())
            .collect();
        let mut splits = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((owner, split)) = self.pending.remove(&id) {
                self.assigned.insert(id, (owner, split.clone()));
                splits.push(split);
            }
        }
        if !splits.is_empty() {
            info!(reader = %reader, count = splits.len(), "Assigning splits");
            crate::metrics::record_splits_assigned("enumerator", splits.len());
        }
        splits
    }

    fn settle(&mut self) {
        if self.discovery_finished && self.pending.is_empty() {
            self.set_phase(EnumeratorPhase::Draining);
        } else {
            self.set_phase(EnumeratorPhase::Idle);
        }
    }

    /// A reader came up; returns the splits already resolved to it
    pub fn register_reader(&mut self, reader: ReaderId) -> ConnectorResult<Vec<S>> {
        self.ensure_open()?;
        if reader.0 >= self.num_readers {
            return Err(ConnectorError::state(format!(
                "{} is outside the configured parallelism {}",
                reader, self.num_readers
            )));
        }
        self.registered.insert(reader);
        let splits = self.take_pending_for(reader);
        if self.phase != EnumeratorPhase::Initializing {
            self.settle();
        }
        Ok(splits)
    }

    /// A reader failed before checkpointing these splits; hold them for its restart.
    pub fn add_splits_back(&mut self, splits: Vec<S>, reader: ReaderId) -> ConnectorResult<()> {
        self.ensure_open()?;
        if !splits.is_empty() {
            warn!(reader = %reader, count = splits.len(), "Splits returned by failed reader");
        }
        self.registered.remove(&reader);
        for split in splits {
            let id = split.split_id();
            self.assigned.remove(&id);
            self.pending.insert(id, (reader, split));
        }
        if self.phase != EnumeratorPhase::Initializing {
            self.settle();
        }
        Ok(())
    }

    /// Bounded source, discovery finished, nothing left for this reader
    pub fn has_no_more_splits(&self, reader: ReaderId) -> bool {
        self.discovery_finished && !self.pending.values().any(|(owner, _)| *owner == reader)
    }

    pub fn snapshot_state(&self, checkpoint_id: u64) -> ConnectorResult<EnumeratorState<S>> {
        self.ensure_open()?;
        Ok(EnumeratorState {
            checkpoint_id,
            assigned: self.assigned.clone(),
            pending: self.pending.clone(),
            discovery_finished: self.discovery_finished,
            round_robin_cursor: self.round_robin_cursor,
        })
    }

    pub fn close(&mut self) {
        self.set_phase(EnumeratorPhase::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Part(u32);

    impl SourceSplit for Part {
        fn split_id(&self) -> String {
            format!("p{}", self.0)
        }
    }

    struct Listing {
        batches: Vec<Vec<Part>>,
        boundedness: Boundedness,
        calls: usize,
    }

    #[async_trait]
    impl SplitDiscovery<Part> for Listing {
        async fn discover(&mut self) -> ConnectorResult<Vec<Part>> {
            let batch = self.batches.get(self.calls).cloned().unwrap_or_default();
            self.calls += 1;
            Ok(batch)
        }

        fn boundedness(&self) -> Boundedness {
            self.boundedness
        }
    }

    fn bounded(parts: &[u32]) -> Box<Listing> {
        Box::new(Listing {
            batches: vec![parts.iter().map(|p| Part(*p)).collect()],
            boundedness: Boundedness::Bounded,
            calls: 0,
        })
    }

    fn ids(splits: &[Part]) -> Vec<u32> {
        splits.iter().map(|p| p.0).collect()
    }

    #[tokio::test]
    async fn test_round_robin_assignment() {
        let mut e = SplitEnumerator::new(bounded(&[0, 1, 2, 3, 4]), 2, AssignmentStrategy::RoundRobin)
            .unwrap();
        assert_eq!(e.phase(), EnumeratorPhase::Initializing);
        e.register_reader(ReaderId(0)).unwrap();
        e.register_reader(ReaderId(1)).unwrap();

        let out = e.discover_and_assign().await.unwrap();
        assert_eq!(ids(&out[&ReaderId(0)]), vec![0, 2, 4]);
        assert_eq!(ids(&out[&ReaderId(1)]), vec![1, 3]);
        assert_eq!(e.phase(), EnumeratorPhase::Draining);
        assert!(e.has_no_more_splits(ReaderId(0)));
    }

    #[tokio::test]
    async fn test_late_reader_gets_pending_splits() {
        let mut e =
            SplitEnumerator::new(bounded(&[0, 1]), 2, AssignmentStrategy::RoundRobin).unwrap();
        e.register_reader(ReaderId(0)).unwrap();
        let out = e.discover_and_assign().await.unwrap();
        assert_eq!(ids(&out[&ReaderId(0)]), vec![0]);
        assert!(!out.contains_key(&ReaderId(1)));
        assert_eq!(e.phase(), EnumeratorPhase::Idle);
        assert!(!e.has_no_more_splits(ReaderId(1)));

        let late = e.register_reader(ReaderId(1)).unwrap();
        assert_eq!(ids(&late), vec![1]);
        assert_eq!(e.phase(), EnumeratorPhase::Draining);
    }

    #[tokio::test]
    async fn test_hash_assignment_is_stable() {
        let mut a = SplitEnumerator::new(bounded(&[0, 1, 2, 3]), 3, AssignmentStrategy::Hash).unwrap();
        let mut b = SplitEnumerator::new(bounded(&[3, 2, 1, 0]), 3, AssignmentStrategy::Hash).unwrap();
        a.discover_and_assign().await.unwrap();
        b.discover_and_assign().await.unwrap();
        for p in 0..4 {
            let id = format!("p{}", p);
            assert_eq!(a.owner_of(&id), b.owner_of(&id));
        }
    }

    #[tokio::test]
    async fn test_assign_is_idempotent() {
        let mut e = SplitEnumerator::new(bounded(&[]), 2, AssignmentStrategy::RoundRobin).unwrap();
        assert!(e.assign(Part(9), ReaderId(1)).unwrap());
        assert!(!e.assign(Part(9), ReaderId(1)).unwrap());
        assert!(e.assign(Part(9), ReaderId(0)).is_err());
    }

    #[tokio::test]
    async fn test_restore_does_not_reassign_or_rediscover_bounded() {
        let mut e =
            SplitEnumerator::new(bounded(&[0, 1, 2]), 2, AssignmentStrategy::RoundRobin).unwrap();
        e.register_reader(ReaderId(0)).unwrap();
        e.discover_and_assign().await.unwrap();
        let state = e.snapshot_state(4).unwrap();
        assert_eq!(state.assigned.len(), 2);
        assert_eq!(state.pending.len(), 1);

        // fresh discovery would return everything again
        let mut restored = SplitEnumerator::restore(
            bounded(&[0, 1, 2, 7]),
            2,
            AssignmentStrategy::RoundRobin,
            state,
        )
        .unwrap();
        restored.register_reader(ReaderId(0)).unwrap();
        let handed = restored.register_reader(ReaderId(1)).unwrap();
        assert_eq!(ids(&handed), vec![1]);
        let out = restored.discover_and_assign().await.unwrap();
        assert!(out.is_empty());
        assert_eq!(restored.owner_of("p7"), None);
    }

    #[tokio::test]
    async fn test_restore_with_fewer_readers_rehomes_assigned_splits() {
        let mut e =
            SplitEnumerator::new(bounded(&[0, 1, 2]), 3, AssignmentStrategy::RoundRobin).unwrap();
        for r in 0..3 {
            e.register_reader(ReaderId(r)).unwrap();
        }
        e.discover_and_assign().await.unwrap();
        let state = e.snapshot_state(2).unwrap();
        assert_eq!(state.assigned["p2"].0, ReaderId(2));

        let mut restored =
            SplitEnumerator::restore(bounded(&[]), 2, AssignmentStrategy::RoundRobin, state)
                .unwrap();
        let owner = restored.owner_of("p2").unwrap();
        assert!(owner.0 < 2);
        assert!(!restored.has_no_more_splits(owner));

        let mut handed = restored.register_reader(ReaderId(0)).unwrap();
        handed.extend(restored.register_reader(ReaderId(1)).unwrap());
        assert_eq!(ids(&handed), vec![2]);
        assert_eq!(restored.owner_of("p0"), Some(ReaderId(0)));
        assert_eq!(restored.owner_of("p1"), Some(ReaderId(1)));
    }

    #[tokio::test]
    async fn test_unbounded_rediscovers_and_dedups() {
        let listing = Box::new(Listing {
            batches: vec![vec![Part(0)], vec![Part(0), Part(1)]],
            boundedness: Boundedness::Unbounded,
            calls: 0,
        });
        let mut e = SplitEnumerator::new(listing, 1, AssignmentStrategy::RoundRobin).unwrap();
        e.register_reader(ReaderId(0)).unwrap();

        let first = e.discover_and_assign().await.unwrap();
        assert_eq!(ids(&first[&ReaderId(0)]), vec![0]);
        let second = e.discover_and_assign().await.unwrap();
        assert_eq!(ids(&second[&ReaderId(0)]), vec![1]);
        assert_eq!(e.phase(), EnumeratorPhase::Idle);
        assert!(!e.has_no_more_splits(ReaderId(0)));
    }

    #[tokio::test]
    async fn test_splits_added_back_return_to_reader() {
        let mut e = SplitEnumerator::new(bounded(&[0]), 1, AssignmentStrategy::RoundRobin).unwrap();
        e.register_reader(ReaderId(0)).unwrap();
        let out = e.discover_and_assign().await.unwrap();
        let splits = out[&ReaderId(0)].clone();

        e.add_splits_back(splits, ReaderId(0)).unwrap();
        assert!(!e.has_no_more_splits(ReaderId(0)));
        let again = e.register_reader(ReaderId(0)).unwrap();
        assert_eq!(ids(&again), vec![0]);
    }

    #[tokio::test]
    async fn test_single_split_goes_to_first_reader() {
        let discovery = Box::new(SingleSplitDiscovery::new(Part(42)));
        let mut e = SplitEnumerator::new(discovery, 4, AssignmentStrategy::FirstReader).unwrap();
        for r in 0..4 {
            e.register_reader(ReaderId(r)).unwrap();
        }
        let out = e.discover_and_assign().await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(ids(&out[&ReaderId(0)]), vec![42]);
    }

    #[tokio::test]
    async fn test_closed_rejects_calls() {
        let mut e = SplitEnumerator::new(bounded(&[0]), 1, AssignmentStrategy::RoundRobin).unwrap();
        e.close();
        assert_eq!(e.phase(), EnumeratorPhase::Closed);
        assert!(e.discover_and_assign().await.is_err());
        assert!(e.snapshot_state(1).is_err());
    }
}
