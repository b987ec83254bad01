use std::hash::BuildHasher;

use ahash::RandomState;
use intentional::Cast;

use crate::object::GcRef;

const INITIAL_BUCKETS: usize = 64;

struct StrNode {
    hash: u64,
    obj: Option<GcRef>,
    /// Index + 1 of the next node in the chain, 0 ends it.
    next: u32,
}

/// The intern table: a chained hash table of string objects.
///
/// Nodes live in a slab and are recycled through a free list, so chains are
/// index links rather than pointers.
pub(crate) struct StringTable {
    heads: Vec<u32>,
    nodes: Vec<StrNode>,
    free: Vec<u32>,
    len: usize,
    hasher: RandomState,
}

impl StringTable {
    pub fn new() -> Self {
        Self {
            heads: vec![0; INITIAL_BUCKETS],
            nodes: Vec::new(),
            free: Vec::new(),
            len: 0,
            hasher: RandomState::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn bucket_count(&self) -> usize {
        self.heads.len()
    }

    pub fn hash(&self, bytes: &[u8]) -> u64 {
        self.hasher.hash_one(bytes)
    }

    fn bucket(&self, hash: u64) -> usize {
        (hash as usize) & (self.heads.len() - 1)
    }

    fn chain(&self, bucket: usize) -> impl Iterator<Item = &StrNode> {
        let mut link = self.heads[bucket];
        std::iter::from_fn(move || {
            let node = self.nodes.get(link.checked_sub(1)? as usize)?;
            link = node.next;
            Some(node)
        })
    }

    /// Finds a string with `hash` for which `matches` answers true.
    pub fn find(&self, hash: u64, mut matches: impl FnMut(GcRef) -> bool) -> Option<GcRef> {
        self.chain(self.bucket(hash))
            .filter(|node| node.hash == hash)
            .filter_map(|node| node.obj)
            .find(|&obj| matches(obj))
    }

    /// Links `obj`. The bucket array doubles once the table holds more
    /// strings than buckets, unless `allow_resize` is false.
    pub fn insert(&mut self, hash: u64, obj: GcRef, allow_resize: bool) {
        let bucket = self.bucket(hash);
        let node = StrNode {
            hash,
            obj: Some(obj),
            next: self.heads[bucket],
        };
        let index = if let Some(index) = self.free.pop() {
            self.nodes[index as usize] = node;
            index
        } else {
            self.nodes.push(node);
            (self.nodes.len() - 1).cast::<u32>()
        };
        self.heads[bucket] = index + 1;
        self.len += 1;
        if allow_resize && self.len > self.heads.len() {
            self.resize(self.heads.len() * 2);
        }
    }

    fn resize(&mut self, buckets: usize) {
        self.heads.clear();
        self.heads.resize(buckets, 0);
        for index in 0..self.nodes.len() {
            if self.nodes[index].obj.is_some() {
                let bucket = self.bucket(self.nodes[index].hash);
                self.nodes[index].next = self.heads[bucket];
                self.heads[bucket] = index.cast::<u32>() + 1;
            }
        }
    }

    fn release(&mut self, index: usize) {
        self.nodes[index].obj = None;
        self.nodes[index].next = 0;
        self.free.push(index.cast::<u32>());
        self.len -= 1;
    }

    /// Unlinks the nodes of `bucket` for which `remove` answers true.
    fn retain_in(&mut self, bucket: usize, mut remove: impl FnMut(GcRef) -> bool) -> usize {
        let mut removed = 0;
        let mut prev: Option<usize> = None;
        let mut link = self.heads[bucket];
        while link != 0 {
            let index = (link - 1) as usize;
            let next = self.nodes[index].next;
            if self.nodes[index].obj.map_or(false, &mut remove) {
                match prev {
                    None => self.heads[bucket] = next,
                    Some(prev) => self.nodes[prev].next = next,
                }
                self.release(index);
                removed += 1;
            } else {
                prev = Some(index);
            }
            link = next;
        }
        removed
    }

    pub fn remove(&mut self, hash: u64, obj: GcRef) -> bool {
        self.retain_in(self.bucket(hash), |other| other == obj) > 0
    }

    /// Sweeps up to `count` buckets starting at `from`, unlinking strings
    /// that are no longer live. Returns the bucket to resume from (the sweep
    /// is complete once it reaches [`Self::bucket_count`]) and the number of
    /// strings removed.
    pub fn sweep(
        &mut self,
        from: usize,
        count: usize,
        mut is_live: impl FnMut(GcRef) -> bool,
    ) -> (usize, usize) {
        let end = from.saturating_add(count).min(self.heads.len());
        let mut removed = 0;
        for bucket in from..end {
            removed += self.retain_in(bucket, |obj| !is_live(obj));
        }
        (end, removed)
    }
}
