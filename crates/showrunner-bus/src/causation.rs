use std::collections::{HashMap, VecDeque};

use showrunner_types::Event;
use uuid::Uuid;

/// Bounded in-memory index from event_id to event, used to answer
/// causation walks without touching storage and to recognize events this
/// process itself published. FIFO eviction keeps it from growing with
/// project age; the authoritative history stays in the event log.
pub struct CausationIndex {
    capacity: usize,
    order: VecDeque<Uuid>,
    entries: HashMap<Uuid, Event>,
}

impl CausationIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::with_capacity(capacity.min(1024)),
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, event: Event) {
        if self.entries.contains_key(&event.event_id) {
            return;
        }
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
        self.order.push_back(event.event_id);
        self.entries.insert(event.event_id, event);
    }

    pub fn get(&self, event_id: &Uuid) -> Option<&Event> {
        self.entries.get(event_id)
    }

    pub fn contains(&self, event_id: &Uuid) -> bool {
        self.entries.contains_key(event_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Walk back through `causation_id` pointers. Returns oldest first;
    /// stops at the first hop that has been evicted.
    pub fn chain(&self, event_id: &Uuid) -> Vec<Event> {
        let mut chain = Vec::new();
        let mut current = Some(*event_id);
        while let Some(id) = current {
            match self.entries.get(&id) {
                Some(event) => {
                    current = event.causation_id;
                    chain.push(event.clone());
                }
                None => break,
            }
        }
        chain.reverse();
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use showrunner_types::EventType;

    fn event(project: &str) -> Event {
        Event::new(project, EventType::ImageGenerated, "image_gen")
    }

    #[test]
    fn fifo_eviction_caps_the_index() {
        let mut index = CausationIndex::new(3);
        let events: Vec<Event> = (0..5).map(|_| event("PROJ-1")).collect();
        for e in &events {
            index.insert(e.clone());
        }
        assert_eq!(index.len(), 3);
        assert!(!index.contains(&events[0].event_id));
        assert!(!index.contains(&events[1].event_id));
        assert!(index.contains(&events[4].event_id));
    }

    #[test]
    fn chain_walks_to_oldest_retained_hop() {
        let mut index = CausationIndex::new(10);
        let root = event("PROJ-1");
        let mid = event("PROJ-1").caused_by(&root);
        let leaf = event("PROJ-1").caused_by(&mid);
        for e in [&root, &mid, &leaf] {
            index.insert(e.clone());
        }
        let chain = index.chain(&leaf.event_id);
        let ids: Vec<_> = chain.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![root.event_id, mid.event_id, leaf.event_id]);
    }

    #[test]
    fn duplicate_insert_is_a_no_op() {
        let mut index = CausationIndex::new(2);
        let e = event("PROJ-1");
        index.insert(e.clone());
        index.insert(e.clone());
        assert_eq!(index.len(), 1);
    }
}
