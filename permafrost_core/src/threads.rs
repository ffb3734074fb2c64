use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadError {
    SlotsExhausted { max: usize },
}

impl fmt::Display for ThreadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadError::SlotsExhausted { max } => {
                write!(f, "all {} access-thread slots are claimed", max)
            }
        }
    }
}

impl std::error::Error for ThreadError {}

// Hands out small dense thread ids used to index per-thread arenas and epoch
// slots. A thread claims a slot on first access to an engine and keeps it
// until the thread exits.
pub struct ThreadRegistry {
    registry_id: u64,
    slots: Box<[AtomicBool]>,
}

impl ThreadRegistry {
    pub fn new(max_access_threads: usize) -> Arc<Self> {
        Arc::new(Self {
            registry_id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            slots: (0..max_access_threads).map(|_| AtomicBool::new(false)).collect(),
        })
    }

    #[inline]
    pub fn max_threads(&self) -> usize {
        self.slots.len()
    }

    pub fn register(&self) -> Result<u16, ThreadError> {
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(idx as u16);
            }
        }
        Err(ThreadError::SlotsExhausted {
            max: self.slots.len(),
        })
    }

    pub fn deregister(&self, thread_id: u16) {
        if let Some(slot) = self.slots.get(thread_id as usize) {
            slot.store(false, Ordering::Release);
        }
    }

    pub fn access_thread_id(self: &Arc<Self>) -> Result<u16, ThreadError> {
        LOCAL_REGISTRATIONS.with(|local| {
            let mut local = local.borrow_mut();
            if let Some(reg) = local
                .iter()
                .find(|reg| reg.registry_id == self.registry_id)
            {
                return Ok(reg.thread_id);
            }

            local.retain(|reg| reg.registry.strong_count() > 0);
            let thread_id = self.register()?;
            local.push(TlsRegistration {
                registry_id: self.registry_id,
                registry: Arc::downgrade(self),
                thread_id,
            });
            Ok(thread_id)
        })
    }
}

struct TlsRegistration {
    registry_id: u64,
    registry: Weak<ThreadRegistry>,
    thread_id: u16,
}

impl Drop for TlsRegistration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(self.thread_id);
        }
    }
}

thread_local! {
    static LOCAL_REGISTRATIONS: RefCell<Vec<TlsRegistration>> = const { RefCell::new(Vec::new()) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn register_exhausts_slots_then_fails() {
        let registry = ThreadRegistry::new(3);
        let ids: Vec<u16> = (0..3)
            .map(|_| registry.register().expect("slot should be available"))
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(matches!(
            registry.register(),
            Err(ThreadError::SlotsExhausted { max: 3 })
        ));

        registry.deregister(1);
        assert_eq!(registry.register().expect("released slot"), 1);
    }

    #[test]
    fn access_thread_id_is_stable_within_a_thread() {
        let registry = ThreadRegistry::new(4);
        let first = registry.access_thread_id().expect("registration failed");
        let second = registry.access_thread_id().expect("lookup failed");
        assert_eq!(first, second);
    }

    #[test]
    fn distinct_threads_get_distinct_ids() {
        let registry = ThreadRegistry::new(8);
        let barrier = Arc::new(Barrier::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                registry.access_thread_id().expect("registration failed")
            }));
        }
        let mut ids: Vec<u16> = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread panicked"))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 4, "each thread must own a unique id");
    }

    #[test]
    fn thread_exit_releases_the_slot() {
        let registry = ThreadRegistry::new(1);
        std::thread::spawn({
            let registry = Arc::clone(&registry);
            move || {
                registry.access_thread_id().expect("registration failed");
            }
        })
        .join()
        .expect("thread panicked");

        // The exiting thread's TLS drop released slot 0.
        assert_eq!(registry.register().expect("slot should be free"), 0);
    }
}
