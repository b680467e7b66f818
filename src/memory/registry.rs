//! Ordered registry of every view in the address space.
//!
//! The registry is the single source of truth for the address-space layout. Views are keyed by
//! base address, so iteration is always in ascending address order, and no two registered views
//! ever overlap.

use std::collections::BTreeMap;

use crate::{
    memory::{
        host,
        view::{Ownership, View},
    },
    Error, Result,
};

/// Address-ordered collection of non-overlapping views.
#[derive(Debug, Default)]
pub struct ViewRegistry {
    views: BTreeMap<usize, View>,
}

impl ViewRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered views.
    #[must_use]
    pub fn len(&self) -> usize {
        self.views.len()
    }

    /// Returns `true` if no view is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Registers `view`.
    ///
    /// Registered views overlapping the new one are removed and returned if they are all
    /// [`Ownership::External`]; their host mappings are not touched since the new view already
    /// replaced them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InternalConsistency`] if the new view overlaps a view this address
    /// space owns. Nothing is changed in that case.
    pub fn insert(&mut self, view: View) -> Result<Vec<View>> {
        let overlapping: Vec<usize> = self
            .views
            .range(..view.end())
            .rev()
            .take_while(|(_, other)| other.end() > view.base())
            .map(|(base, _)| *base)
            .collect();

        if let Some(owned) = overlapping.iter().find(|base| {
            self.views
                .get(*base)
                .is_some_and(|other| other.ownership() != Ownership::External)
        }) {
            debug_assert!(
                false,
                "view {:#x}-{:#x} overlaps owned view at {owned:#x}",
                view.base(),
                view.end()
            );
            return Err(Error::InternalConsistency(format!(
                "view {:#x}-{:#x} overlaps owned view at {owned:#x}",
                view.base(),
                view.end()
            )));
        }

        let mut superseded = Vec::with_capacity(overlapping.len());
        for base in overlapping {
            if let Some(other) = self.views.remove(&base) {
                log::debug!(
                    "superseding external view {:#x}-{:#x} by {:#x}-{:#x}",
                    other.base(),
                    other.end(),
                    view.base(),
                    view.end()
                );
                superseded.push(other);
            }
        }

        log::trace!(
            "created view {:#x}-{:#x} {:?} {:?}",
            view.base(),
            view.end(),
            view.kind(),
            view.protect()
        );
        self.views.insert(view.base(), view);
        Ok(superseded)
    }

    /// Unregisters and returns the view based at `base`.
    pub fn remove(&mut self, base: usize) -> Option<View> {
        self.views.remove(&base)
    }

    /// Returns the view containing `addr`.
    #[must_use]
    pub fn find(&self, addr: usize) -> Option<&View> {
        self.views
            .range(..=addr)
            .next_back()
            .map(|(_, view)| view)
            .filter(|view| view.contains(addr))
    }

    /// Returns the view containing `addr`, mutably.
    pub fn find_mut(&mut self, addr: usize) -> Option<&mut View> {
        self.views
            .range_mut(..=addr)
            .next_back()
            .map(|(_, view)| view)
            .filter(|view| view.contains(addr))
    }

    /// Returns the lowest view intersecting `[addr, addr + size)`.
    #[must_use]
    pub fn find_range(&self, addr: usize, size: usize) -> Option<&View> {
        if let Some(view) = self.find(addr) {
            return Some(view);
        }
        self.views
            .range(addr..)
            .next()
            .map(|(_, view)| view)
            .filter(|view| view.intersects(addr, size))
    }

    /// Returns the lowest view based at or above `addr`.
    #[must_use]
    pub fn next_at_or_after(&self, addr: usize) -> Option<&View> {
        self.views.range(addr..).next().map(|(_, view)| view)
    }

    /// Returns the highest view based below `addr`.
    #[must_use]
    pub fn previous(&self, addr: usize) -> Option<&View> {
        self.views.range(..addr).next_back().map(|(_, view)| view)
    }

    /// Returns the views in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = &View> {
        self.views.values()
    }

    /// Removes and returns every view, in ascending address order.
    pub fn drain(&mut self) -> Vec<View> {
        std::mem::take(&mut self.views).into_values().collect()
    }

    /// Checks that the views are page-aligned and pairwise disjoint.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let mask = host::page_mask();
        let mut prev_end = 0usize;
        for view in self.views.values() {
            if view.base() & mask != 0 || view.size() & mask != 0 || view.base() < prev_end {
                return false;
            }
            if view.pages().len() * host::page_size() != view.size() {
                return false;
            }
            prev_end = view.end();
        }
        true
    }
}
