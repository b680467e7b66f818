//! Per-page protection map of a view.
//!
//! [`PageMap`] holds one [`PageFlags`] byte per host page of a view. All accessors are keyed by
//! page index and bounds-checked; range operations either apply to every page or fail before
//! touching any.

use std::ops::Range;

use crate::{memory::PageFlags, Error, Result};

/// Bounds-checked array of page flags, one entry per host page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageMap {
    flags: Vec<PageFlags>,
}

impl PageMap {
    /// Creates a map of `count` pages, all set to `flags`.
    #[must_use]
    pub fn new(count: usize, flags: PageFlags) -> Self {
        Self {
            flags: vec![flags; count],
        }
    }

    /// Returns the number of pages tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    /// Returns `true` if the map tracks no pages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Returns the flags of page `index`, or `None` if out of range.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<PageFlags> {
        self.flags.get(index).copied()
    }

    fn check(&self, pages: &Range<usize>) -> Result<()> {
        if pages.start > pages.end || pages.end > self.flags.len() {
            return Err(Error::PageOutOfBounds {
                index: pages.end.max(pages.start),
                count: self.flags.len(),
            });
        }
        Ok(())
    }

    /// Returns the flags of a page range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageOutOfBounds`] if the range exceeds the map.
    pub fn slice(&self, pages: Range<usize>) -> Result<&[PageFlags]> {
        self.check(&pages)?;
        Ok(&self.flags[pages])
    }

    /// Sets every page in `pages` to `flags`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageOutOfBounds`] if the range exceeds the map; no page is changed.
    pub fn fill(&mut self, pages: Range<usize>, flags: PageFlags) -> Result<()> {
        self.check(&pages)?;
        self.flags[pages].fill(flags);
        Ok(())
    }

    /// Rewrites every page in `pages` through `f`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageOutOfBounds`] if the range exceeds the map; no page is changed.
    pub fn update<F>(&mut self, pages: Range<usize>, f: F) -> Result<()>
    where
        F: Fn(PageFlags) -> PageFlags,
    {
        self.check(&pages)?;
        for page in &mut self.flags[pages] {
            *page = f(*page);
        }
        Ok(())
    }

    /// Returns `true` if every page in `pages` satisfies `f`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageOutOfBounds`] if the range exceeds the map.
    pub fn all<F>(&self, pages: Range<usize>, f: F) -> Result<bool>
    where
        F: Fn(PageFlags) -> bool,
    {
        Ok(self.slice(pages)?.iter().all(|flags| f(*flags)))
    }

    /// Returns the number of consecutive pages from `start` carrying the same flags as `start`.
    ///
    /// Returns 0 if `start` is out of range.
    #[must_use]
    pub fn run_length(&self, start: usize) -> usize {
        match self.flags.get(start) {
            Some(first) => self.flags[start..]
                .iter()
                .take_while(|flags| *flags == first)
                .count(),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_and_get() {
        let map = PageMap::new(4, PageFlags::READ);
        assert_eq!(map.len(), 4);
        assert!(!map.is_empty());
        assert_eq!(map.get(3), Some(PageFlags::READ));
        assert_eq!(map.get(4), None);
    }

    #[test]
    fn test_fill_out_of_bounds_changes_nothing() {
        let mut map = PageMap::new(2, PageFlags::READ);
        let err = map.fill(1..3, PageFlags::empty()).unwrap_err();
        assert!(matches!(err, Error::PageOutOfBounds { index: 3, count: 2 }));
        assert_eq!(map.get(1), Some(PageFlags::READ));
    }

    #[test]
    fn test_update_and_run_length() {
        let mut map = PageMap::new(5, PageFlags::READ);
        map.update(1..3, |f| f | PageFlags::COMMITTED).unwrap();

        assert_eq!(map.run_length(0), 1);
        assert_eq!(map.run_length(1), 2);
        assert_eq!(map.run_length(3), 2);
        assert_eq!(map.run_length(5), 0);

        assert!(map.all(1..3, PageFlags::is_committed).unwrap());
        assert!(!map.all(0..3, PageFlags::is_committed).unwrap());
    }
}
