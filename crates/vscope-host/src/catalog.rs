//! Catalog paging.
//!
//! Device catalogs (variables, RT registers) are fetched in (start, count)
//! windows and merged until the device-declared total is satisfied. The
//! declared total can change mid-fetch (the device may have reset and
//! re-registered), in which case the fetch restarts from zero.

use std::collections::BTreeMap;

use log::debug;
use vscope_protocol::{CatalogEntry, CatalogPage};

/// A complete, ordered catalog of named entries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    /// Build from entries already ordered by index.
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Catalog { entries }
    }

    /// Entries in index order.
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry's index by name.
    pub fn index_of(&self, name: &str) -> Option<u8> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.index)
    }

    /// Look up an entry's name by index.
    pub fn name_of(&self, index: u8) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.index == index)
            .map(|entry| entry.name.as_str())
    }

    /// The names in index order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }
}

/// Outcome of absorbing one page into a fetch in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    /// Entries were merged; more windows remain.
    Progress,
    /// The declared total changed; the fetch restarted from zero.
    Restarted,
    /// Every index is present; the catalog is complete.
    Complete,
}

/// Incremental state of one catalog fetch.
#[derive(Debug, Default)]
pub struct CatalogFetch {
    declared_total: Option<u8>,
    received: BTreeMap<u8, String>,
}

impl CatalogFetch {
    /// Start an empty fetch.
    pub fn new() -> Self {
        Self::default()
    }

    /// The next (start, count) window to request, or `None` when complete.
    pub fn next_window(&self, page_size: u8) -> Option<(u8, u8)> {
        let total = match self.declared_total {
            // Nothing known yet: ask from zero.
            None => return Some((0, page_size)),
            Some(total) => total,
        };

        (0..total)
            .find(|index| !self.received.contains_key(index))
            .map(|start| (start, page_size))
    }

    /// Merge one page. A changed declared total discards everything
    /// received so far and restarts from zero.
    pub fn absorb(&mut self, page: &CatalogPage) -> PageOutcome {
        if self.declared_total != Some(page.total) {
            if self.declared_total.is_some() {
                debug!(
                    "catalog total changed {:?} -> {}; restarting fetch",
                    self.declared_total, page.total
                );
                self.received.clear();
                self.declared_total = Some(page.total);
                return PageOutcome::Restarted;
            }
            self.declared_total = Some(page.total);
        }

        for entry in &page.entries {
            self.received.insert(entry.index, entry.name.clone());
        }

        if self.is_complete() {
            PageOutcome::Complete
        } else {
            PageOutcome::Progress
        }
    }

    /// Whether every index `0..total` has been received.
    pub fn is_complete(&self) -> bool {
        match self.declared_total {
            Some(total) => self.received.len() == total as usize,
            None => false,
        }
    }

    /// Consume the fetch into a catalog, if complete.
    pub fn finish(self) -> Option<Catalog> {
        if !self.is_complete() {
            return None;
        }
        Some(Catalog::new(
            self.received
                .into_iter()
                .map(|(index, name)| CatalogEntry { index, name })
                .collect(),
        ))
    }
}
