//! Bounded pool of client ids.

use shared::ClientId;

/// Hands out ids in `[1, capacity]`, first-fit.
///
/// Methods take `&mut self`; callers sharing an allocator across threads wrap
/// it in a lock (see [`crate::client_manager::ClientManager`]).
#[derive(Debug)]
pub struct IdAllocator {
    slots: Vec<bool>,
    in_use: usize,
}

impl IdAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![false; capacity],
            in_use: 0,
        }
    }

    /// Claims the lowest free id, or `None` when every slot is taken.
    pub fn find_available_id(&mut self) -> Option<ClientId> {
        let index = self.slots.iter().position(|taken| !taken)?;
        let id = ClientId::new(index as u32 + 1)?;
        self.slots[index] = true;
        self.in_use += 1;
        Some(id)
    }

    /// Returns an id to the pool. Returns false if it was not allocated.
    pub fn free_id(&mut self, id: ClientId) -> bool {
        match self.slots.get_mut(id.get() as usize - 1) {
            Some(slot) if *slot => {
                *slot = false;
                self.in_use -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn is_allocated(&self, id: ClientId) -> bool {
        self.slots
            .get(id.get() as usize - 1)
            .copied()
            .unwrap_or(false)
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.in_use == self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn id(raw: u32) -> ClientId {
        ClientId::new(raw).unwrap()
    }

    #[test]
    fn test_ids_start_at_one() {
        let mut ids = IdAllocator::new(3);
        assert_eq!(ids.find_available_id(), Some(id(1)));
        assert_eq!(ids.find_available_id(), Some(id(2)));
        assert_eq!(ids.find_available_id(), Some(id(3)));
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut ids = IdAllocator::new(2);
        ids.find_available_id();
        ids.find_available_id();
        assert!(ids.is_full());
        assert_eq!(ids.find_available_id(), None);
        assert_eq!(ids.in_use(), 2);
    }

    #[test]
    fn test_freed_id_is_reused_first() {
        let mut ids = IdAllocator::new(3);
        ids.find_available_id();
        ids.find_available_id();
        ids.find_available_id();

        assert!(ids.free_id(id(2)));
        assert!(!ids.is_allocated(id(2)));
        assert_eq!(ids.find_available_id(), Some(id(2)));
    }

    #[test]
    fn test_double_free_and_out_of_range() {
        let mut ids = IdAllocator::new(2);
        let first = ids.find_available_id().unwrap();
        assert!(ids.free_id(first));
        assert!(!ids.free_id(first));
        assert!(!ids.free_id(id(99)));
        assert!(!ids.is_allocated(id(99)));
        assert_eq!(ids.in_use(), 0);
    }

    #[test]
    fn test_interleaved_allocations_never_collide() {
        let mut ids = IdAllocator::new(8);
        let mut live: HashSet<ClientId> = HashSet::new();

        // Deterministic churn: allocate until full, free every other, repeat.
        for round in 0..5 {
            while let Some(new_id) = ids.find_available_id() {
                assert!(live.insert(new_id), "id {} handed out twice", new_id);
            }
            assert_eq!(live.len(), 8);

            let to_free: Vec<ClientId> = live
                .iter()
                .copied()
                .filter(|i| (i.get() + round) % 2 == 0)
                .collect();
            for freed in to_free {
                assert!(ids.free_id(freed));
                live.remove(&freed);
            }
            assert_eq!(ids.in_use(), live.len());
        }
    }
}
