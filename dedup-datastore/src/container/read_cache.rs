use std::sync::{Arc, Mutex};

use super::format::Container;

struct CacheLine {
    container_id: u64,
    container: Arc<Container>,
    used: bool,
}

struct Stripe {
    lines: Vec<Option<CacheLine>>,
    next_victim: usize,
}

/// Striped clock cache of committed containers, keyed by primary id.
pub struct ContainerReadCache {
    stripes: Vec<Mutex<Stripe>>,
}

const STRIPE_COUNT: usize = 8;

impl ContainerReadCache {
    pub fn new(line_count: usize) -> Self {
        let per_stripe = std::cmp::max(1, line_count / STRIPE_COUNT);
        let stripes = (0..STRIPE_COUNT)
            .map(|_| {
                Mutex::new(Stripe {
                    lines: (0..per_stripe).map(|_| None).collect(),
                    next_victim: 0,
                })
            })
            .collect();
        Self { stripes }
    }

    fn stripe(&self, container_id: u64) -> &Mutex<Stripe> {
        &self.stripes[(container_id % STRIPE_COUNT as u64) as usize]
    }

    pub fn get(&self, container_id: u64) -> Option<Arc<Container>> {
        let mut stripe = self.stripe(container_id).lock().unwrap();
        for line in stripe.lines.iter_mut().flatten() {
            if line.container_id == container_id {
                line.used = true;
                return Some(Arc::clone(&line.container));
            }
        }
        None
    }

    pub fn insert(&self, container_id: u64, container: Arc<Container>) {
        let mut stripe = self.stripe(container_id).lock().unwrap();

        for line in stripe.lines.iter_mut().flatten() {
            if line.container_id == container_id {
                line.container = container;
                line.used = true;
                return;
            }
        }

        let line = CacheLine {
            container_id,
            container,
            used: true,
        };
        if let Some(slot) = stripe.lines.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(line);
            return;
        }

        // clock eviction with one reference bit
        let count = stripe.lines.len();
        let victim = loop {
            let idx = stripe.next_victim % count;
            stripe.next_victim = (idx + 1) % count;
            match &mut stripe.lines[idx] {
                Some(victim) if victim.used => victim.used = false,
                _ => break idx,
            }
        };
        stripe.lines[victim] = Some(line);
    }

    /// Drops a container after a merge, move or delete.
    pub fn invalidate(&self, container_id: u64) {
        let mut stripe = self.stripe(container_id).lock().unwrap();
        for slot in stripe.lines.iter_mut() {
            if slot.as_ref().map(|line| line.container_id) == Some(container_id) {
                *slot = None;
            }
        }
    }

    pub fn cached_count(&self) -> usize {
        self.stripes
            .iter()
            .map(|stripe| stripe.lock().unwrap().lines.iter().flatten().count())
            .sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn container(id: u64) -> Arc<Container> {
        Arc::new(Container::new(id, 1024))
    }

    #[test]
    fn hit_miss_and_invalidate() {
        let cache = ContainerReadCache::new(16);
        assert!(cache.get(1).is_none());

        cache.insert(1, container(1));
        assert_eq!(cache.get(1).unwrap().primary_id, 1);

        cache.invalidate(1);
        assert!(cache.get(1).is_none());
    }

    #[test]
    fn eviction_keeps_recently_used_lines() {
        let cache = ContainerReadCache::new(8); // one line per stripe
        // ids in one stripe: 0, 8, 16
        cache.insert(0, container(0));
        assert!(cache.get(0).is_some());
        cache.insert(8, container(8));
        assert!(cache.get(0).is_none());
        assert!(cache.get(8).is_some());
        cache.insert(16, container(16));
        assert!(cache.get(16).is_some());
        assert_eq!(cache.cached_count(), 1);
    }
}
