use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::dram::DramArena;

const QUIESCENT: u64 = 0;

#[repr(align(64))]
struct EpochSlot {
    pinned: AtomicU64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RetiredBlock {
    offset: u64,
    size: u64,
    seq: u64,
}

// Quiescent-state reclamation for volatile index blocks. A thread publishes
// the global sequence while inside an operation; a block unlinked at sequence
// R is handed back to the arena only once every published slot has moved past
// R. A block is therefore never freed while any reader that could have seen
// it is still pinned.
pub struct EpochManager {
    global_seq: AtomicU64,
    slots: Box<[EpochSlot]>,
    retired: Mutex<VecDeque<RetiredBlock>>,
    retired_blocks: AtomicU64,
    reclaimed_blocks: AtomicU64,
}

impl EpochManager {
    pub fn new(max_access_threads: usize) -> Self {
        Self {
            global_seq: AtomicU64::new(1),
            slots: (0..max_access_threads)
                .map(|_| EpochSlot {
                    pinned: AtomicU64::new(QUIESCENT),
                })
                .collect(),
            retired: Mutex::new(VecDeque::new()),
            retired_blocks: AtomicU64::new(0),
            reclaimed_blocks: AtomicU64::new(0),
        }
    }

    pub fn pin(&self, thread_id: u16) -> EpochPin<'_> {
        let slot = &self.slots[thread_id as usize];
        let seq = self.global_seq.load(Ordering::SeqCst).max(1);
        slot.pinned.store(seq, Ordering::SeqCst);
        EpochPin { slot }
    }

    pub fn retire(&self, offset: u64, size: u64) {
        let seq = self.global_seq.fetch_add(1, Ordering::SeqCst);
        self.retired_blocks.fetch_add(1, Ordering::AcqRel);
        let mut retired = self
            .retired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        retired.push_back(RetiredBlock { offset, size, seq });
    }

    pub fn collect(&self, arena: &DramArena, max_blocks: usize) -> usize {
        let horizon = self.reclaim_horizon();
        let mut retired = self
            .retired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut reclaimed = 0_usize;
        while reclaimed < max_blocks {
            let reclaimable = retired.front().map(|block| block.seq < horizon);
            if reclaimable != Some(true) {
                break;
            }
            if let Some(block) = retired.pop_front() {
                arena.free(block.offset, block.size);
                reclaimed += 1;
            }
        }

        if reclaimed > 0 {
            self.reclaimed_blocks
                .fetch_add(reclaimed as u64, Ordering::AcqRel);
            self.retired_blocks
                .fetch_sub(reclaimed as u64, Ordering::AcqRel);
        }
        reclaimed
    }

    fn reclaim_horizon(&self) -> u64 {
        let mut horizon = self.global_seq.load(Ordering::SeqCst);
        for slot in self.slots.iter() {
            let pinned = slot.pinned.load(Ordering::SeqCst);
            if pinned != QUIESCENT {
                horizon = horizon.min(pinned);
            }
        }
        horizon
    }

    #[inline]
    pub fn retired_blocks(&self) -> u64 {
        self.retired_blocks.load(Ordering::Acquire)
    }

    #[inline]
    pub fn reclaimed_blocks(&self) -> u64 {
        self.reclaimed_blocks.load(Ordering::Acquire)
    }
}

pub struct EpochPin<'a> {
    slot: &'a EpochSlot,
}

impl Drop for EpochPin<'_> {
    fn drop(&mut self) {
        self.slot.pinned.store(QUIESCENT, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> DramArena {
        DramArena::new(1 << 20).expect("arena alloc failed")
    }

    #[test]
    fn retired_block_survives_while_a_reader_is_pinned() {
        let arena = arena();
        let epoch = EpochManager::new(4);
        let offset = arena.alloc(64).expect("alloc failed");

        let pin = epoch.pin(0);
        epoch.retire(offset, 64);
        assert_eq!(
            epoch.collect(&arena, usize::MAX),
            0,
            "block retired after the pin must not be reclaimed under it"
        );
        drop(pin);

        assert_eq!(epoch.collect(&arena, usize::MAX), 1);
        assert_eq!(epoch.retired_blocks(), 0);
        assert_eq!(epoch.reclaimed_blocks(), 1);

        // The arena got the block back.
        assert_eq!(arena.alloc(64).expect("realloc failed"), offset);
    }

    #[test]
    fn quiescent_threads_do_not_hold_the_horizon() {
        let arena = arena();
        let epoch = EpochManager::new(4);
        let offset = arena.alloc(32).expect("alloc failed");

        {
            let _pin = epoch.pin(2);
        }
        epoch.retire(offset, 32);
        assert_eq!(
            epoch.collect(&arena, usize::MAX),
            1,
            "a dropped pin is quiescent and must not block reclamation"
        );
    }

    #[test]
    fn collect_respects_the_block_budget() {
        let arena = arena();
        let epoch = EpochManager::new(2);
        for _ in 0..8 {
            let offset = arena.alloc(16).expect("alloc failed");
            epoch.retire(offset, 16);
        }
        assert_eq!(epoch.collect(&arena, 3), 3);
        assert_eq!(epoch.retired_blocks(), 5);
        assert_eq!(epoch.collect(&arena, usize::MAX), 5);
    }

    #[test]
    fn blocks_retired_during_a_pin_wait_for_that_pin_only() {
        let arena = arena();
        let epoch = EpochManager::new(2);

        let early = arena.alloc(16).expect("alloc failed");
        epoch.retire(early, 16);

        let pin = epoch.pin(1);
        let late = arena.alloc(16).expect("alloc failed");
        epoch.retire(late, 16);

        // The early block predates the pin's sequence and may go; the late one
        // must wait.
        assert_eq!(epoch.collect(&arena, usize::MAX), 1);
        assert_eq!(epoch.retired_blocks(), 1);
        drop(pin);
        assert_eq!(epoch.collect(&arena, usize::MAX), 1);
    }
}
