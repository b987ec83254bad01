use std::iter;

use crate::arena::CellId;

/// Registrations held by one chunk.
pub(crate) const CHUNK_LEN: usize = 26;

/// What happens to a registration when finalizers are selected.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Selection {
    /// The object is still reachable.
    Keep,
    /// The object is unreachable and its finalizer must run.
    Pending,
    /// The object is unreachable and has nothing left to finalize.
    Forget,
}

struct Chunk {
    cells: [CellId; CHUNK_LEN],
    len: u8,
    /// Bit `i` is set when `cells[i]` awaits its finalizer.
    pending: u32,
    next: Option<Box<Chunk>>,
}

impl Chunk {
    fn new(next: Option<Box<Chunk>>) -> Box<Self> {
        Box::new(Self {
            cells: [0; CHUNK_LEN],
            len: 0,
            pending: 0,
            next,
        })
    }

    fn is_full(&self) -> bool {
        usize::from(self.len) == CHUNK_LEN
    }

    fn entries(&self) -> impl Iterator<Item = (CellId, bool)> + '_ {
        (0..usize::from(self.len)).map(move |i| (self.cells[i], self.pending >> i & 1 != 0))
    }

    fn position(&self, cell: CellId) -> Option<usize> {
        self.cells[..usize::from(self.len)]
            .iter()
            .position(|&other| other == cell)
    }

    fn swap_remove(&mut self, index: usize) -> CellId {
        let last = usize::from(self.len) - 1;
        let cell = self.cells[index];
        let last_pending = self.pending >> last & 1;
        self.cells[index] = self.cells[last];
        self.pending &= !(1 << index);
        self.pending |= last_pending << index;
        self.pending &= !(1 << last);
        self.len -= 1;
        cell
    }
}

/// The objects of one arena that carry a finalizer.
///
/// Registrations are stored in fixed-size chunks linked from the most
/// recently created one. Each chunk keeps a bitmask of the entries whose
/// finalizer has been scheduled.
#[derive(Default)]
pub(crate) struct FinalizerList {
    head: Option<Box<Chunk>>,
    len: usize,
}

impl FinalizerList {
    fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        iter::successors(self.head.as_deref(), |chunk| chunk.next.as_deref())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, cell: CellId) {
        if self.head.as_ref().map_or(true, |chunk| chunk.is_full()) {
            self.head = Some(Chunk::new(self.head.take()));
        }
        if let Some(chunk) = &mut self.head {
            chunk.cells[usize::from(chunk.len)] = cell;
            chunk.len += 1;
            self.len += 1;
        }
    }

    #[cfg(test)]
    pub fn contains(&self, cell: CellId) -> bool {
        self.chunks().any(|chunk| chunk.position(cell).is_some())
    }

    /// Drops the registration of `cell`, pending or not.
    pub fn remove(&mut self, cell: CellId) -> bool {
        let mut emptied = None;
        let mut cursor = self.head.as_deref_mut();
        while let Some(chunk) = cursor {
            if let Some(index) = chunk.position(cell) {
                chunk.swap_remove(index);
                emptied = Some(chunk.len == 0);
                break;
            }
            cursor = chunk.next.as_deref_mut();
        }
        let Some(emptied) = emptied else {
            return false;
        };
        self.len -= 1;
        if emptied {
            self.prune();
        }
        true
    }

    /// Applies `select` to every registration that is not already pending.
    pub fn select(&mut self, mut select: impl FnMut(CellId) -> Selection) {
        let mut removed = 0;
        let mut cursor = self.head.as_deref_mut();
        while let Some(chunk) = cursor {
            let mut index = 0;
            while index < usize::from(chunk.len) {
                if chunk.pending >> index & 1 != 0 {
                    index += 1;
                    continue;
                }
                match select(chunk.cells[index]) {
                    Selection::Keep => index += 1,
                    Selection::Pending => {
                        chunk.pending |= 1 << index;
                        index += 1;
                    }
                    Selection::Forget => {
                        chunk.swap_remove(index);
                        removed += 1;
                    }
                }
            }
            cursor = chunk.next.as_deref_mut();
        }
        self.len -= removed;
        if removed > 0 {
            self.prune();
        }
    }

    pub fn has_pending(&self) -> bool {
        self.chunks().any(|chunk| chunk.pending != 0)
    }

    pub fn pending_cells(&self) -> impl Iterator<Item = CellId> + '_ {
        self.chunks().flat_map(|chunk| {
            chunk
                .entries()
                .filter_map(|(cell, pending)| pending.then_some(cell))
        })
    }

    /// Unregisters and returns one object whose finalizer is due.
    pub fn take_pending(&mut self) -> Option<CellId> {
        let mut taken = None;
        let mut cursor = self.head.as_deref_mut();
        while let Some(chunk) = cursor {
            if chunk.pending != 0 {
                let index = chunk.pending.trailing_zeros() as usize;
                taken = Some((chunk.swap_remove(index), chunk.len == 0));
                break;
            }
            cursor = chunk.next.as_deref_mut();
        }
        let (cell, emptied) = taken?;
        self.len -= 1;
        if emptied {
            self.prune();
        }
        Some(cell)
    }

    /// Unlinks chunks left empty by removals.
    pub fn prune(&mut self) {
        let mut kept = Vec::new();
        let mut next = self.head.take();
        while let Some(mut chunk) = next {
            next = chunk.next.take();
            if chunk.len > 0 {
                kept.push(chunk);
            }
        }
        for mut chunk in kept.into_iter().rev() {
            chunk.next = self.head.take();
            self.head = Some(chunk);
        }
    }
}

impl Drop for FinalizerList {
    fn drop(&mut self) {
        let mut next = self.head.take();
        while let Some(mut chunk) = next {
            next = chunk.next.take();
        }
    }
}
