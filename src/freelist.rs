use crate::arena::{CellId, CellMemory};

/// Runs of up to this many cells are kept in exact-size bins.
pub(crate) const BINS: u32 = 8;

/// Per-arena free runs.
///
/// Small runs live in intrusive singly linked bins: the bin holds the head
/// cell id and every run stores the next run's cell id in its own memory.
/// Larger runs are packed as `(cells << 16) | cell` into a sorted vector,
/// which makes lookup a best fit with ties going to the lowest address.
pub(crate) struct FreeList {
    bins: [CellId; BINS as usize],
    oversized: Vec<u32>,
    hint: CellId,
}

const fn pack(cell: CellId, cells: u32) -> u32 {
    cells << 16 | cell
}

const fn unpack(entry: u32) -> (CellId, u32) {
    (entry & 0xFFFF, entry >> 16)
}

impl FreeList {
    pub fn new(hint: CellId) -> Self {
        Self {
            bins: [0; BINS as usize],
            oversized: Vec::new(),
            hint,
        }
    }

    /// The lowest cell that may head a free run.
    pub fn hint(&self) -> CellId {
        self.hint
    }

    pub fn lower_hint(&mut self, cell: CellId) {
        self.hint = self.hint.min(cell);
    }

    pub fn clear(&mut self, hint: CellId) {
        self.bins = [0; BINS as usize];
        self.oversized.clear();
        self.hint = hint;
    }

    pub fn push(&mut self, mem: CellMemory, cell: CellId, cells: u32) {
        debug_assert!(cells > 0);
        if cells <= BINS {
            let bin = &mut self.bins[(cells - 1) as usize];
            mem.write_link(cell, *bin);
            *bin = cell;
        } else {
            let entry = pack(cell, cells);
            let at = self.oversized.partition_point(|&other| other < entry);
            self.oversized.insert(at, entry);
        }
        self.lower_hint(cell);
    }

    /// Removes the smallest run holding at least `cells` cells, returning
    /// its head and its full length.
    pub fn take(&mut self, mem: CellMemory, cells: u32) -> Option<(CellId, u32)> {
        for size in cells..=BINS {
            let bin = &mut self.bins[(size - 1) as usize];
            if *bin != 0 {
                let head = *bin;
                *bin = mem.read_link(head);
                return Some((head, size));
            }
        }
        let at = self
            .oversized
            .partition_point(|&entry| unpack(entry).1 < cells);
        (at < self.oversized.len()).then(|| unpack(self.oversized.remove(at)))
    }

    pub fn is_empty(&self) -> bool {
        self.bins.iter().all(|&head| head == 0) && self.oversized.is_empty()
    }

    /// Counts the free cells held by the list.
    #[cfg(test)]
    pub fn free_cells(&self, mem: CellMemory) -> u32 {
        let mut total = 0;
        for (index, &head) in self.bins.iter().enumerate() {
            let mut cell = head;
            while cell != 0 {
                total += index as u32 + 1;
                cell = mem.read_link(cell);
            }
        }
        total + self.oversized.iter().map(|&entry| unpack(entry).1).sum::<u32>()
    }
}

#[cfg(test)]
mod tests {
    use crate::arena::{Arena, FIRST_CELL};

    #[test]
    fn exact_bins_are_lifo() {
        let arena = Arena::new(0).unwrap();
        let mem = arena.memory();
        let mut list = super::FreeList::new(u32::MAX);
        list.push(mem, FIRST_CELL + 10, 2);
        list.push(mem, FIRST_CELL + 20, 2);
        assert_eq!(list.hint(), FIRST_CELL + 10);
        assert_eq!(list.free_cells(mem), 4);
        assert_eq!(list.take(mem, 2), Some((FIRST_CELL + 20, 2)));
        assert_eq!(list.take(mem, 2), Some((FIRST_CELL + 10, 2)));
        assert_eq!(list.take(mem, 2), None);
        assert!(list.is_empty());
    }

    #[test]
    fn small_requests_fall_through_to_larger_bins() {
        let arena = Arena::new(0).unwrap();
        let mem = arena.memory();
        let mut list = super::FreeList::new(u32::MAX);
        list.push(mem, FIRST_CELL + 40, 5);
        assert_eq!(list.take(mem, 3), Some((FIRST_CELL + 40, 5)));
    }

    #[test]
    fn oversized_best_fit() {
        let arena = Arena::new(0).unwrap();
        let mem = arena.memory();
        let mut list = super::FreeList::new(u32::MAX);
        list.push(mem, FIRST_CELL + 100, 40);
        list.push(mem, FIRST_CELL + 200, 12);
        list.push(mem, FIRST_CELL + 300, 20);
        list.push(mem, FIRST_CELL + 50, 20);

        // The smallest run that fits wins, then the lowest address.
        assert_eq!(list.take(mem, 15), Some((FIRST_CELL + 50, 20)));
        assert_eq!(list.take(mem, 15), Some((FIRST_CELL + 300, 20)));
        assert_eq!(list.take(mem, 9), Some((FIRST_CELL + 200, 12)));
        assert_eq!(list.take(mem, 41), None);
        assert_eq!(list.take(mem, 40), Some((FIRST_CELL + 100, 40)));
    }
}
