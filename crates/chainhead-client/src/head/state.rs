//! Pinned-block bookkeeping of one follow session.
//!
//! Pure state transitions, driven by follow events. Every transition returns
//! the notifications to emit and the hashes to unpin on the node; it never
//! talks to the node itself. After every transition `best` and `finalized`
//! are pinned.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chainhead_core::SubscriptionId;

use crate::events::ChainHeadEvent;
use crate::types::{BlockHash, PinnedBlock, RuntimeVersion};
use crate::wire::{self, RuntimeEvent};

/// Output of a transition.
#[derive(Debug, Default, PartialEq)]
pub struct Applied {
    pub events: Vec<ChainHeadEvent>,
    pub unpinned: Vec<BlockHash>,
}

#[derive(Debug)]
pub struct Session {
    subscription: SubscriptionId,
    blocks: HashMap<BlockHash, PinnedBlock>,
    best: BlockHash,
    finalized: BlockHash,
    /// Finalized blocks still pinned, oldest first.
    finalized_chain: VecDeque<BlockHash>,
    retention: usize,
}

impl Session {
    /// Build the session from the `initialized` event.
    ///
    /// `first_number` and `first_parent` describe the oldest reported
    /// finalized block; they come from its header.
    pub fn initialize(
        subscription: SubscriptionId,
        init: &wire::Initialized,
        first_number: u64,
        first_parent: BlockHash,
        retention: usize,
    ) -> Option<(Self, Applied)> {
        let hashes = init.hashes();
        let last = hashes.last()?.clone();
        let runtime = match &init.finalized_block_runtime {
            Some(RuntimeEvent::Valid { spec }) => Some(Arc::new(spec.clone())),
            _ => None,
        };
        let invalid = match &init.finalized_block_runtime {
            Some(RuntimeEvent::Invalid { error }) => Some(error.clone()),
            _ => None,
        };

        let mut blocks = HashMap::new();
        let mut parent = first_parent;
        for (i, hash) in hashes.iter().enumerate() {
            blocks.insert(
                hash.clone(),
                PinnedBlock {
                    hash: hash.clone(),
                    number: first_number + i as u64,
                    parent: parent.clone(),
                    runtime_upgraded: false,
                    finalized: true,
                    runtime: runtime.clone(),
                    invalid_runtime: invalid.clone(),
                },
            );
            parent = hash.clone();
        }

        let mut session = Self {
            subscription,
            blocks,
            best: last.clone(),
            finalized: last.clone(),
            finalized_chain: hashes.iter().cloned().collect(),
            retention: retention.max(1),
        };
        let mut applied = Applied {
            events: vec![ChainHeadEvent::BestBlock { hash: last.clone() }],
            unpinned: Vec::new(),
        };
        if let Some(error) = invalid {
            applied
                .events
                .insert(0, ChainHeadEvent::InvalidRuntime { hash: last, error });
        }
        applied.unpinned = session.enforce_retention();
        Some((session, applied))
    }

    pub fn subscription(&self) -> &SubscriptionId {
        &self.subscription
    }

    pub fn best(&self) -> &BlockHash {
        &self.best
    }

    pub fn finalized(&self) -> &BlockHash {
        &self.finalized
    }

    pub fn block(&self, hash: &BlockHash) -> Option<&PinnedBlock> {
        self.blocks.get(hash)
    }

    pub fn is_pinned(&self, hash: &BlockHash) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn pinned(&self) -> impl Iterator<Item = &PinnedBlock> {
        self.blocks.values()
    }

    pub fn pinned_hashes(&self) -> Vec<BlockHash> {
        self.blocks.keys().cloned().collect()
    }

    pub fn runtime_at(&self, hash: &BlockHash) -> Option<Arc<RuntimeVersion>> {
        self.blocks.get(hash).and_then(|b| b.runtime.clone())
    }

    pub fn new_block(&mut self, ev: wire::NewBlock) -> Applied {
        if self.blocks.contains_key(&ev.block_hash) {
            tracing::debug!(hash = %ev.block_hash, "duplicate newBlock ignored");
            return Applied::default();
        }
        let (number, parent_runtime) = match self.blocks.get(&ev.parent_block_hash) {
            Some(parent) => (parent.number + 1, parent.runtime.clone()),
            None => {
                tracing::warn!(
                    hash = %ev.block_hash,
                    parent = %ev.parent_block_hash,
                    "newBlock with unknown parent"
                );
                (0, None)
            }
        };

        let mut events = Vec::new();
        let (runtime, upgraded, invalid) = match ev.new_runtime {
            Some(RuntimeEvent::Valid { spec }) => {
                tracing::info!(
                    hash = %ev.block_hash,
                    spec_version = spec.spec_version,
                    "runtime upgrade"
                );
                (Some(Arc::new(spec)), true, None)
            }
            Some(RuntimeEvent::Invalid { error }) => {
                tracing::warn!(hash = %ev.block_hash, error = %error, "block announced with invalid runtime");
                events.push(ChainHeadEvent::InvalidRuntime {
                    hash: ev.block_hash.clone(),
                    error: error.clone(),
                });
                (parent_runtime, false, Some(error))
            }
            None => (parent_runtime, false, None),
        };

        let block = PinnedBlock {
            hash: ev.block_hash.clone(),
            number,
            parent: ev.parent_block_hash,
            runtime_upgraded: upgraded,
            finalized: false,
            runtime,
            invalid_runtime: invalid,
        };
        self.blocks.insert(block.hash.clone(), block.clone());
        events.insert(0, ChainHeadEvent::NewBlock(block));
        Applied {
            events,
            unpinned: Vec::new(),
        }
    }

    pub fn best_block_changed(&mut self, hash: BlockHash) -> Applied {
        if !self.blocks.contains_key(&hash) {
            tracing::warn!(hash = %hash, "bestBlockChanged for a block that is not pinned");
            return Applied::default();
        }
        self.best = hash.clone();
        Applied {
            events: vec![ChainHeadEvent::BestBlock { hash }],
            unpinned: Vec::new(),
        }
    }

    pub fn finalize(&mut self, ev: wire::Finalized) -> Applied {
        for hash in &ev.finalized_block_hashes {
            match self.blocks.get_mut(hash) {
                Some(block) => {
                    block.finalized = true;
                    self.finalized_chain.push_back(hash.clone());
                }
                None => tracing::warn!(hash = %hash, "finalized block is not pinned"),
            }
        }
        if let Some(last) = ev
            .finalized_block_hashes
            .iter()
            .rev()
            .find(|h| self.blocks.contains_key(*h))
        {
            self.finalized = last.clone();
        }

        let mut unpinned = Vec::new();
        for hash in &ev.pruned_block_hashes {
            if *hash == self.finalized {
                continue;
            }
            if self.blocks.remove(hash).is_some() {
                unpinned.push(hash.clone());
            }
        }
        let mut events = Vec::new();
        if !self.blocks.contains_key(&self.best) {
            tracing::warn!(best = %self.best, "best block pruned, falling back to finalized");
            self.best = self.finalized.clone();
            events.push(ChainHeadEvent::BestBlock {
                hash: self.best.clone(),
            });
        }
        unpinned.extend(self.enforce_retention());

        events.insert(
            0,
            ChainHeadEvent::Finalized {
                hashes: ev.finalized_block_hashes,
                pruned: ev.pruned_block_hashes,
            },
        );
        Applied { events, unpinned }
    }

    /// Release blocks on request. The best and finalized blocks stay pinned.
    pub fn unpin(&mut self, hashes: &[BlockHash]) -> Vec<BlockHash> {
        let mut removed = Vec::new();
        for hash in hashes {
            if *hash == self.best || *hash == self.finalized {
                tracing::debug!(hash = %hash, "refusing to unpin best or finalized block");
                continue;
            }
            if self.blocks.remove(hash).is_some() {
                removed.push(hash.clone());
            }
        }
        if !removed.is_empty() {
            let gone: HashSet<&BlockHash> = removed.iter().collect();
            self.finalized_chain.retain(|h| !gone.contains(h));
        }
        removed
    }

    fn enforce_retention(&mut self) -> Vec<BlockHash> {
        let mut unpinned = Vec::new();
        self.finalized_chain.retain(|h| self.blocks.contains_key(h));
        while self.finalized_chain.len() > self.retention {
            let Some(old) = self.finalized_chain.pop_front() else {
                break;
            };
            if old == self.finalized || old == self.best {
                self.finalized_chain.push_back(old);
                break;
            }
            if self.blocks.remove(&old).is_some() {
                unpinned.push(old);
            }
        }
        unpinned
    }
}

/// Bounded memory of unpinned hashes.
#[derive(Debug)]
pub struct PrunedHistory {
    set: HashSet<BlockHash>,
    order: VecDeque<BlockHash>,
    capacity: usize,
}

impl PrunedHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    pub fn record(&mut self, hash: BlockHash) {
        if self.capacity == 0 || !self.set.insert(hash.clone()) {
            return;
        }
        self.order.push_back(hash);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
    }

    pub fn forget(&mut self, hash: &BlockHash) {
        if self.set.remove(hash) {
            self.order.retain(|h| h != hash);
        }
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.set.contains(hash)
    }
}
