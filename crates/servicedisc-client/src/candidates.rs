use parking_lot::Mutex;
use rand::Rng;
use servicedisc_common::protocol::ServiceDescriptor;
use std::sync::Arc;
use tracing::debug;

/// Callback raised every time a candidate is evicted after a failed call.
pub type EvictionObserver = Box<dyn Fn(&ServiceDescriptor) + Send + Sync>;

/// Candidate instances of one resolved service.
///
/// `all` is the resolution result and never changes. `active` starts as a
/// copy of it, shrinks as calls fail, and is refilled from `all` when it
/// runs empty, so a proxy keeps trying instances that failed earlier once
/// every other option is gone.
pub struct CandidateSet {
    all: Arc<[ServiceDescriptor]>,
    active: Mutex<Vec<ServiceDescriptor>>,
    observer: Option<EvictionObserver>,
}

impl CandidateSet {
    pub fn new(all: Vec<ServiceDescriptor>) -> Self {
        let all: Arc<[ServiceDescriptor]> = all.into();
        Self {
            active: Mutex::new(all.to_vec()),
            all,
            observer: None,
        }
    }

    pub fn with_observer<F>(all: Vec<ServiceDescriptor>, observer: F) -> Self
    where
        F: Fn(&ServiceDescriptor) + Send + Sync + 'static,
    {
        Self {
            observer: Some(Box::new(observer)),
            ..Self::new(all)
        }
    }

    /// Every descriptor the set was resolved with.
    pub fn all(&self) -> &[ServiceDescriptor] {
        &self.all
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Picks the next instance to call.
    ///
    /// Returns `None` only when the set was resolved empty.
    pub fn select(&self) -> Option<ServiceDescriptor> {
        let mut active = self.active.lock();
        if active.is_empty() && !self.all.is_empty() {
            debug!("All {} candidates evicted, resetting", self.all.len());
            active.extend(self.all.iter().cloned());
        }

        match active.len() {
            0 => None,
            1 => Some(active[0].clone()),
            n => Some(active[rand::thread_rng().gen_range(0..n)].clone()),
        }
    }

    /// Removes `descriptor` from the active list and notifies the observer.
    ///
    /// Returns whether it was still active; evicting twice is a no-op apart
    /// from the notification.
    pub fn evict(&self, descriptor: &ServiceDescriptor) -> bool {
        let removed = {
            let mut active = self.active.lock();
            let before = active.len();
            active.retain(|d| d.id != descriptor.id);
            active.len() != before
        };

        if let Some(observer) = &self.observer {
            observer(descriptor);
        }
        removed
    }
}

impl std::fmt::Debug for CandidateSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateSet")
            .field("all", &self.all.len())
            .field("active", &self.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use servicedisc_common::protocol::HostKind;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn descriptors(n: usize) -> Vec<ServiceDescriptor> {
        (0..n)
            .map(|i| {
                ServiceDescriptor::new(
                    "tests.Candidate",
                    None,
                    HostKind::Http,
                    format!("http://localhost:{}/", 5000 + i),
                )
            })
            .collect()
    }

    #[test]
    fn test_empty_set_selects_nothing() {
        let set = CandidateSet::new(Vec::new());
        assert!(set.select().is_none());
    }

    #[test]
    fn test_single_candidate_always_selected() {
        let all = descriptors(1);
        let set = CandidateSet::new(all.clone());
        for _ in 0..5 {
            assert_eq!(set.select().unwrap().id, all[0].id);
        }
    }

    #[test]
    fn test_selection_stays_within_active() {
        let all = descriptors(3);
        let set = CandidateSet::new(all.clone());
        set.evict(&all[0]);

        for _ in 0..50 {
            assert_ne!(set.select().unwrap().id, all[0].id);
        }
    }

    #[test]
    fn test_reset_after_all_evicted() {
        let all = descriptors(3);
        let set = CandidateSet::new(all.clone());

        let mut evicted = HashSet::new();
        for _ in 0..3 {
            let picked = set.select().unwrap();
            assert!(evicted.insert(picked.id), "evicted candidate selected again");
            assert!(set.evict(&picked));
        }
        assert_eq!(set.active_count(), 0);

        // Fourth selection refills from the full list
        let picked = set.select().unwrap();
        assert!(all.iter().any(|d| d.id == picked.id));
        assert_eq!(set.active_count(), 3);
    }

    #[test]
    fn test_evict_is_idempotent() {
        let all = descriptors(2);
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        let set = CandidateSet::with_observer(all.clone(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(set.evict(&all[1]));
        assert!(!set.evict(&all[1]));
        assert_eq!(set.active_count(), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_evictions() {
        let all = descriptors(8);
        let set = Arc::new(CandidateSet::new(all.clone()));

        let handles: Vec<_> = all
            .into_iter()
            .map(|d| {
                let set = set.clone();
                std::thread::spawn(move || set.evict(&d))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(set.active_count(), 0);
    }
}
