//! Hooks that force otherwise unreachable failure paths, for tests.

use std::cell::Cell;

thread_local! {
    static FAIL_ALLOCATIONS: Cell<u32> = const { Cell::new(0) };
}

/// Make the next `count` tombstone duplicate allocations on this thread fail
/// as if the allocator were exhausted.
pub fn fail_next_allocations(count: u32) {
    FAIL_ALLOCATIONS.with(|slot| slot.set(count));
}

pub(crate) fn take_allocation_failure() -> bool {
    FAIL_ALLOCATIONS.with(|slot| {
        let remaining = slot.get();
        if remaining == 0 {
            return false;
        }
        slot.set(remaining - 1);
        true
    })
}
