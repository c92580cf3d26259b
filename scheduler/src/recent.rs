use std::collections::{HashSet, VecDeque};

/// Bounded set of ids that forgets the oldest entry first
#[derive(Debug)]
pub(crate) struct RecentIds {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    pub fn insert(&mut self, id: String) {
        if self.members.contains(&id) {
            return;
        }
        self.members.insert(id.clone());
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub fn remove(&mut self, id: &str) {
        if self.members.remove(id) {
            self.order.retain(|x| x != id);
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest() {
        let mut recent = RecentIds::new(2);
        recent.insert("a".into());
        recent.insert("b".into());
        recent.insert("a".into());
        recent.insert("c".into());

        assert!(!recent.contains("a"));
        assert!(recent.contains("b"));
        assert!(recent.contains("c"));
        assert_eq!(recent.len(), 2);

        recent.remove("b");
        recent.insert("d".into());
        assert!(recent.contains("c"));
        assert!(recent.contains("d"));
    }
}
