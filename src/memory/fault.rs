//! Classification of host protection faults.

use crate::memory::{allocator::VmState, host, PageFlags};

/// Outcome of classifying a protection fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum FaultKind {
    /// First access to a guard page. The guard has been removed and the access may be retried.
    GuardPage,
    /// Access to the lowest page above the thread's stack limit.
    StackOverflow,
    /// Any other fault, including faults outside every view.
    AccessViolation,
}

impl VmState {
    /// Classifies a fault at `addr`.
    ///
    /// `stack_limit` is the lowest valid stack address of the faulting thread, if known.
    pub(crate) fn handle_fault(&mut self, addr: usize, stack_limit: Option<usize>) -> FaultKind {
        let page = host::round_addr(addr, host::page_mask());
        let Some(view) = self.views.find_mut(page) else {
            return FaultKind::AccessViolation;
        };

        let mut kind = FaultKind::AccessViolation;
        if let Some(flags) = view.flags_at(page) {
            if flags.contains(PageFlags::GUARD) {
                let widened = flags - PageFlags::GUARD;
                match view.set_protection(page, host::page_size(), widened) {
                    Ok(()) => kind = FaultKind::GuardPage,
                    Err(err) => log::warn!("failed to clear guard page at {page:#x}: {err}"),
                }
            }
        }

        if let Some(stack) = stack_limit {
            if addr >= stack && addr - stack < host::page_size() {
                kind = FaultKind::StackOverflow;
            }
        }
        kind
    }
}
