/// FlatStorage works similar to a map. Each element is assigned a key (its index in a Vec) when inserted.
/// The key can be used to read/modify/remove the element. Freed slots are reused through a free list.
pub struct FlatStorage<T> {
    data: Vec<AllocNode<T>>,
    count: usize,
    free: usize,
}

const INVALID_ID: usize = usize::MAX;

enum AllocNode<T> {
    Vacant(usize), // next free slot
    Occupied(T),
}

impl<T> Default for FlatStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FlatStorage<T> {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            count: 0,
            free: INVALID_ID,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The key that the next `add` will assign.
    pub fn next_key(&self) -> usize {
        if self.free == INVALID_ID {
            self.data.len()
        } else {
            self.free
        }
    }

    /// return the key assigned to the new element.
    pub fn add(&mut self, val: T) -> usize {
        self.count += 1;
        if self.free == INVALID_ID {
            self.data.push(AllocNode::Occupied(val));
            return self.data.len() - 1;
        }
        let key = self.free;
        if let AllocNode::Vacant(next) = self.data[key] {
            self.free = next;
        } else {
            unreachable!("free list points to an occupied slot {key}");
        }
        self.data[key] = AllocNode::Occupied(val);
        key
    }

    pub fn remove(&mut self, key: usize) -> Option<T> {
        if !matches!(self.data.get(key), Some(AllocNode::Occupied(_))) {
            return None;
        }
        let node = std::mem::replace(&mut self.data[key], AllocNode::Vacant(self.free));
        self.free = key;
        self.count -= 1;
        match node {
            AllocNode::Occupied(val) => Some(val),
            AllocNode::Vacant(_) => None,
        }
    }

    pub fn get(&self, key: usize) -> Option<&T> {
        match self.data.get(key) {
            Some(AllocNode::Occupied(val)) => Some(val),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut T> {
        match self.data.get_mut(key) {
            Some(AllocNode::Occupied(val)) => Some(val),
            _ => None,
        }
    }

    /// Consume the storage and yield all occupied elements.
    pub fn into_values(self) -> impl Iterator<Item = T> {
        self.data.into_iter().filter_map(|node| match node {
            AllocNode::Occupied(val) => Some(val),
            AllocNode::Vacant(_) => None,
        })
    }
}
