// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Saved signal dispositions, dense-indexed by signal number.
//!
//! A slot holds the kernel-visible handler state that was in effect before
//! the trampoline displaced it; the `signal`/`sigaction` shims then update
//! it in place of the kernel. Shim writes serialize on a per-slot lock; the
//! trampoline reads an unlocked snapshot. A handler install racing with a
//! fault is observationally equivalent to the fault having arrived just
//! before the install, so a stale but self-consistent snapshot is fine.

use std::cell::UnsafeCell;
use std::sync::Mutex;

pub(super) struct DispositionTable {
    slots: Box<[DispositionSlot]>,
}

struct DispositionSlot {
    lock: Mutex<()>,
    saved: UnsafeCell<Option<libc::sigaction>>,
}

// The UnsafeCell is only written under `lock`; the trampoline's unlocked
// reads are tolerated per the module comment.
unsafe impl Sync for DispositionSlot {}

impl DispositionTable {
    pub(super) fn new(len: usize) -> Self {
        let slots = (0..len)
            .map(|_| DispositionSlot {
                lock: Mutex::new(()),
                saved: UnsafeCell::new(None),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots }
    }

    fn slot(&self, signum: libc::c_int) -> Option<&DispositionSlot> {
        usize::try_from(signum).ok().and_then(|i| self.slots.get(i))
    }

    /// Records the pre-attach disposition of `signum`. Attach-path only.
    pub(super) fn store(&self, signum: libc::c_int, action: libc::sigaction) {
        if let Some(slot) = self.slot(signum) {
            let _guard = slot.lock.lock().unwrap();
            // SAFETY: writes to the cell only happen under the slot lock.
            unsafe { *slot.saved.get() = Some(action) };
        }
    }

    /// Unlocked snapshot for the trampoline. `None` for out-of-range or
    /// unmanaged signals.
    pub(super) fn snapshot(&self, signum: libc::c_int) -> Option<libc::sigaction> {
        let slot = self.slot(signum)?;
        // SAFETY: see the module comment; the slot is plain old data and a
        // racing install yields an equally valid older/newer disposition.
        unsafe { *slot.saved.get() }
    }

    /// Empties the slot, returning what it held. Detach and panic paths.
    /// The slot lock is internal and only ever held for a few instructions
    /// by a shim, so taking it on the trampoline's terminal path cannot
    /// deadlock against a host-held lock.
    pub(super) fn take(&self, signum: libc::c_int) -> Option<libc::sigaction> {
        let slot = self.slot(signum)?;
        let _guard = slot.lock.lock().unwrap();
        // SAFETY: writes to the cell only happen under the slot lock.
        unsafe { (*slot.saved.get()).take() }
    }

    /// Runs `f` on the slot under its lock. Returns `None` when `signum`
    /// is out of range; `f` still runs (on an empty slot) for in-range but
    /// unmanaged signals so it can decide to forward.
    pub(super) fn with_slot<R>(
        &self,
        signum: libc::c_int,
        f: impl FnOnce(&mut Option<libc::sigaction>) -> R,
    ) -> Option<R> {
        let slot = self.slot(signum)?;
        let _guard = slot.lock.lock().unwrap();
        // SAFETY: exclusive access is guaranteed by the slot lock for every
        // writer; the trampoline only snapshots.
        Some(f(unsafe { &mut *slot.saved.get() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_action() -> libc::sigaction {
        // SAFETY: sigaction is plain data; zeroed means SIG_DFL, no flags.
        unsafe { std::mem::zeroed() }
    }

    #[test]
    fn test_store_snapshot_take() {
        let table = DispositionTable::new(32);
        assert!(table.snapshot(libc::SIGSEGV).is_none());

        let mut action = empty_action();
        action.sa_flags = libc::SA_SIGINFO;
        table.store(libc::SIGSEGV, action);

        let seen = table.snapshot(libc::SIGSEGV).expect("managed");
        assert_eq!(seen.sa_flags, libc::SA_SIGINFO);

        let taken = table.take(libc::SIGSEGV).expect("still set");
        assert_eq!(taken.sa_flags, libc::SA_SIGINFO);
        assert!(table.snapshot(libc::SIGSEGV).is_none());
        assert!(table.take(libc::SIGSEGV).is_none());
    }

    #[test]
    fn test_out_of_range_signals() {
        let table = DispositionTable::new(8);
        assert!(table.snapshot(100).is_none());
        assert!(table.snapshot(-1).is_none());
        assert!(table.with_slot(100, |_| ()).is_none());
        table.store(100, empty_action()); // silently ignored
    }

    #[test]
    fn test_with_slot_sees_unmanaged_as_empty() {
        let table = DispositionTable::new(32);
        let managed = table
            .with_slot(libc::SIGINT, |slot| slot.is_some())
            .expect("in range");
        assert!(!managed);
    }
}
