//! Generation-checked arena of pipes.
//!
//! Slots are reused after a pipe is torn down, but every reuse bumps the slot's generation, so a
//! [`PipeId`] held past teardown never resolves to the pipe that replaced it.

use std::fmt;

/// Handle to a pipe: slot index plus the generation the slot had when the pipe was allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId {
    index: u32,
    generation: u32,
}

impl PipeId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe#{}.{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Live pipes, addressable by id and by allocation order.
pub struct PipeRegistry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    order: Vec<PipeId>,
}

impl<T> Default for PipeRegistry<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            order: Vec::new(),
        }
    }
}

impl<T> fmt::Debug for PipeRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.order.iter()).finish()
    }
}

impl<T> PipeRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: T) -> PipeId {
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.value = Some(value);
                PipeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    value: Some(value),
                });
                PipeId {
                    index,
                    generation: 0,
                }
            }
        };

        self.order.push(id);
        id
    }

    fn slot(&self, id: PipeId) -> Option<&Slot<T>> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
    }

    pub fn get(&self, id: PipeId) -> Option<&T> {
        self.slot(id).and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, id: PipeId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.value.as_mut())
    }

    pub fn contains(&self, id: PipeId) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&mut self, id: PipeId) -> Option<T> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)?;
        let value = slot.value.take()?;
        self.free.push(id.index);
        self.order.retain(|p| *p != id);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The `k`-th live pipe in allocation order.
    pub fn nth(&self, k: usize) -> Option<(PipeId, &T)> {
        let id = *self.order.get(k)?;
        self.get(id).map(|v| (id, v))
    }

    /// Position of `id` among live pipes, in allocation order.
    pub fn position(&self, id: PipeId) -> Option<usize> {
        self.order.iter().position(|p| *p == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = PipeId> + '_ {
        self.order.iter().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PipeId, &T)> + '_ {
        self.order
            .iter()
            .filter_map(move |id| self.get(*id).map(|v| (*id, v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_id_does_not_resolve_after_reuse() {
        let mut reg = PipeRegistry::new();
        let a = reg.insert("a");
        assert_eq!(reg.remove(a), Some("a"));
        let b = reg.insert("b");
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert_eq!(reg.get(a), None);
        assert_eq!(reg.remove(a), None);
        assert_eq!(reg.get(b), Some(&"b"));
    }

    #[test]
    fn order_follows_allocation() {
        let mut reg = PipeRegistry::new();
        let ids: Vec<_> = (0..4).map(|i| reg.insert(i)).collect();
        reg.remove(ids[1]);
        let live: Vec<_> = reg.iter().map(|(_, v)| *v).collect();
        assert_eq!(live, vec![0, 2, 3]);
        assert_eq!(reg.nth(1).map(|(id, _)| id), Some(ids[2]));
        assert_eq!(reg.position(ids[3]), Some(2));

        // a reused slot goes to the back of the order
        let e = reg.insert(4);
        assert_eq!(e.index(), ids[1].index());
        assert_eq!(reg.nth(3).map(|(_, v)| *v), Some(4));
        assert_eq!(reg.len(), 4);
    }

    #[test]
    fn double_remove_is_harmless() {
        let mut reg = PipeRegistry::new();
        let a = reg.insert(());
        assert!(reg.remove(a).is_some());
        assert!(reg.remove(a).is_none());
        assert!(reg.is_empty());
        // the slot was freed once, so only one reuse is possible
        let b = reg.insert(());
        let c = reg.insert(());
        assert_ne!(b.index(), c.index());
    }
}
