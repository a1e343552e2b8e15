//! Min-heap of interfaces keyed by load factor.
//!
//! Every move through the heap writes the element's position back into its
//! `heap_index`, so fix-ups can start at arbitrary positions without a
//! search.

use std::sync::Arc;

use crate::Interface;

#[derive(Default, Debug)]
pub(crate) struct IfaceHeap {
    data: Vec<Arc<Interface>>,
}

impl IfaceHeap {
    pub(crate) fn root(&self) -> Option<&Arc<Interface>> {
        self.data.first()
    }

    pub(crate) fn get(&self, idx: usize) -> Option<&Arc<Interface>> {
        self.data.get(idx)
    }

    pub(crate) fn clear(&mut self) {
        self.data.clear();
    }

    fn assign(&mut self, idx: usize, iface: Arc<Interface>) {
        iface.set_heap_index(idx);
        self.data[idx] = iface;
    }

    pub(crate) fn insert(&mut self, iface: Arc<Interface>) {
        iface.set_heap_index(self.data.len());
        self.data.push(iface);
        self.shift_up(self.data.len() - 1);
    }

    /// Moves the element at `idx` towards the root until its parent's load
    /// is no greater than its own.
    pub(crate) fn shift_up(&mut self, mut idx: usize) {
        let moving = self.data[idx].clone();
        let moving_load = moving.load();
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.data[parent].load() <= moving_load {
                break;
            }
            let p = self.data[parent].clone();
            self.assign(idx, p);
            idx = parent;
        }
        self.assign(idx, moving);
    }

    /// Moves the element at `idx` towards the leaves until no child has a
    /// smaller load.
    pub(crate) fn shift_down(&mut self, mut idx: usize) {
        let moving = self.data[idx].clone();
        let moving_load = moving.load();
        loop {
            let left = idx * 2 + 1;
            let right = idx * 2 + 2;

            let mut sel = None;
            if left < self.data.len() {
                sel = Some(left);
            }
            if right < self.data.len() && self.data[right].load() < self.data[left].load() {
                sel = Some(right);
            }

            match sel {
                Some(child) if self.data[child].load() < moving_load => {
                    let c = self.data[child].clone();
                    self.assign(idx, c);
                    idx = child;
                }
                _ => break,
            }
        }
        self.assign(idx, moving);
    }

    /// Checks the heap ordering and the `heap_index` back-pointers.
    #[cfg(test)]
    pub(crate) fn assert_invariant(&self) {
        for (i, iface) in self.data.iter().enumerate() {
            assert_eq!(iface.heap_index(), i, "stale heap index at {i}");
            if i > 0 {
                let parent = (i - 1) / 2;
                assert!(
                    self.data[parent].load() <= iface.load(),
                    "heap violation at {i}: parent load {} > child load {}",
                    self.data[parent].load(),
                    iface.load()
                );
            }
        }
    }
}
