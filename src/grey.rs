use crate::arena::CellId;

const INITIAL_CAPACITY: usize = 64;

/// A LIFO of cell ids waiting to be traversed.
///
/// Slot 0 always holds the sentinel cell id 0, which no object can have, so
/// popping stops at the sentinel without a separate length check.
pub(crate) struct GreyStack {
    slots: Box<[CellId]>,
    top: usize,
}

impl GreyStack {
    pub fn new() -> Self {
        Self {
            slots: vec![0; INITIAL_CAPACITY].into_boxed_slice(),
            top: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.top
    }

    pub fn is_empty(&self) -> bool {
        self.top == 0
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn push(&mut self, cell: CellId) {
        debug_assert_ne!(cell, 0);
        if self.top + 1 == self.slots.len() {
            self.grow();
        }
        self.top += 1;
        self.slots[self.top] = cell;
    }

    pub fn pop(&mut self) -> Option<CellId> {
        let cell = self.slots[self.top];
        if cell == 0 {
            return None;
        }
        self.top -= 1;
        Some(cell)
    }

    fn grow(&mut self) {
        let mut slots = vec![0; self.slots.len() * 2].into_boxed_slice();
        slots[..self.slots.len()].copy_from_slice(&self.slots);
        self.slots = slots;
    }
}

#[test]
fn grey_stack_grows_and_drains() {
    let mut stack = GreyStack::new();
    assert_eq!(stack.pop(), None);
    for cell in 1..=200 {
        stack.push(cell);
    }
    assert_eq!(stack.len(), 200);
    assert!(stack.capacity() >= 200);
    for cell in (1..=200).rev() {
        assert_eq!(stack.pop(), Some(cell));
    }
    assert!(stack.is_empty());
    assert_eq!(stack.pop(), None);
}
