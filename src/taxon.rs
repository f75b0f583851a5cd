//! Ordered registry of taxa shared by every tree of a run.
//!
//! Bit index `i` of every split refers to the `i`-th registered taxon, so
//! the namespace must not change once splits have been computed against it.
//! Encoding a tree or creating a split distribution locks the namespace;
//! from then on it is shared read-only (typically behind an `Arc`).

use std::sync::atomic::{AtomicBool, Ordering};

use indexmap::IndexSet;

use crate::bitset::Bitset;
use crate::error::{Result, SumTreesError};

#[derive(Debug, Default)]
pub struct TaxonNamespace {
    labels: IndexSet<String>,
    locked: AtomicBool,
}

impl TaxonNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an unlocked namespace from labels, in order. Repeated labels
    /// keep their first index.
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TaxonNamespace {
            labels: labels.into_iter().map(Into::into).collect(),
            locked: AtomicBool::new(false),
        }
    }

    /// Registers a taxon and returns its bit index. Registering an existing
    /// label returns the index it already has, even after locking.
    pub fn register(&mut self, label: &str) -> Result<usize> {
        if let Some(idx) = self.labels.get_index_of(label) {
            return Ok(idx);
        }
        if self.is_locked() {
            return Err(SumTreesError::NamespaceLocked {
                label: label.to_string(),
            });
        }
        let (idx, _) = self.labels.insert_full(label.to_string());
        Ok(idx)
    }

    pub fn lock(&self) {
        self.locked.store(true, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels.get_index_of(label)
    }

    /// Like [`index_of`](Self::index_of) but fails for unknown labels.
    pub fn require(&self, label: &str) -> Result<usize> {
        self.index_of(label).ok_or_else(|| SumTreesError::UnknownTaxon {
            label: label.to_string(),
        })
    }

    pub fn label(&self, idx: usize) -> Option<&str> {
        self.labels.get_index(idx).map(String::as_str)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }

    /// Number of taxa `N`.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Words per bitset for this namespace.
    pub fn words(&self) -> usize {
        Bitset::words_for(self.len())
    }

    /// Bitmask with one bit set per registered taxon.
    pub fn all_taxa_mask(&self) -> Bitset {
        Bitset::full(self.words(), self.len())
    }

    /// Bitmask of a single taxon.
    pub fn taxon_mask(&self, idx: usize) -> Bitset {
        Bitset::singleton(self.words(), idx)
    }

    /// Labels of the taxa whose bits are set in `split`.
    pub fn split_labels<'a>(&'a self, split: &Bitset) -> impl Iterator<Item = &'a str> + use<'a> {
        let indices: Vec<usize> = split.iter_ones().collect();
        indices.into_iter().filter_map(move |idx| self.label(idx))
    }
}

impl Clone for TaxonNamespace {
    fn clone(&self) -> Self {
        TaxonNamespace {
            labels: self.labels.clone(),
            locked: AtomicBool::new(self.is_locked()),
        }
    }
}

impl PartialEq for TaxonNamespace {
    /// Two namespaces are interchangeable when they assign the same indices.
    fn eq(&self, other: &Self) -> bool {
        self.labels.iter().eq(other.labels.iter())
    }
}
