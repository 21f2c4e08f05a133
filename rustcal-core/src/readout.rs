//! Read-out storage: raw amplitude samples keyed by collection and group.

use crate::error::{Error, Result};
use crate::isotope::SpectralLine;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One sub-channel stream of raw amplitude samples within a collection.
///
/// Samples are append-only during loading and immutable afterwards; the
/// spectrum builder is the only reader. The expected emission lines for
/// this group are attached at load time and drive peak matching.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ReadOutDataGroup {
    samples: Vec<f64>,
    lines: Vec<SpectralLine>,
}

impl ReadOutDataGroup {
    /// Creates an empty group expecting the given lines (ascending energy).
    #[must_use]
    pub fn new(lines: Vec<SpectralLine>) -> Self {
        Self {
            samples: Vec::new(),
            lines,
        }
    }

    /// Appends one raw amplitude sample.
    pub fn push(&mut self, amplitude: f64) {
        self.samples.push(amplitude);
    }

    /// Returns the raw amplitude samples.
    #[must_use]
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Returns the expected emission lines for this group.
    #[must_use]
    pub fn lines(&self) -> &[SpectralLine] {
        &self.lines
    }

    /// Returns the number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if no samples have been loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Appends all samples from another group. The expected lines of
    /// `self` win; they were attached when the group was first created.
    pub fn append(&mut self, other: &ReadOutDataGroup) {
        self.samples.extend_from_slice(&other.samples);
        if self.lines.is_empty() && !other.lines.is_empty() {
            self.lines = other.lines.clone();
        }
    }
}

/// One detector channel unit: an ordered sequence of data groups.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ReadOutCollection {
    channel_id: u32,
    groups: Vec<ReadOutDataGroup>,
}

impl ReadOutCollection {
    /// Creates an empty collection for the given detector channel id.
    #[must_use]
    pub fn new(channel_id: u32) -> Self {
        Self {
            channel_id,
            groups: Vec::new(),
        }
    }

    /// Returns the detector channel id this collection belongs to.
    #[must_use]
    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    /// Returns the number of groups.
    #[must_use]
    pub fn number_of_groups(&self) -> usize {
        self.groups.len()
    }

    /// Returns the group at `index`.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] if `index >= number_of_groups()`.
    pub fn group(&self, index: usize) -> Result<&ReadOutDataGroup> {
        self.groups
            .get(index)
            .ok_or_else(|| Error::out_of_range("group", index, self.groups.len()))
    }

    /// Returns a mutable handle to the group at `index`, creating any
    /// missing groups up to it. New groups start with the supplied lines.
    pub fn group_or_insert(
        &mut self,
        index: usize,
        lines: &[SpectralLine],
    ) -> &mut ReadOutDataGroup {
        while self.groups.len() <= index {
            self.groups.push(ReadOutDataGroup::new(lines.to_vec()));
        }
        &mut self.groups[index]
    }

    /// Iterates over the groups in order.
    pub fn groups(&self) -> impl Iterator<Item = &ReadOutDataGroup> {
        self.groups.iter()
    }

    /// Merges another collection for the same channel into this one.
    pub fn append(&mut self, other: &ReadOutCollection) {
        for (index, group) in other.groups.iter().enumerate() {
            self.group_or_insert(index, group.lines()).append(group);
        }
    }
}

/// Keyed storage for all loaded read-out data.
///
/// Collections are indexed contiguously `0..len()` in first-appearance
/// order of their channel ids; indices are stable for the lifetime of the
/// store.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ReadOutStore {
    collections: Vec<ReadOutCollection>,
}

impl ReadOutStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of collections.
    #[must_use]
    pub fn number_of_collections(&self) -> usize {
        self.collections.len()
    }

    /// Returns the largest group count over all collections.
    #[must_use]
    pub fn number_of_groups(&self) -> usize {
        self.collections
            .iter()
            .map(ReadOutCollection::number_of_groups)
            .max()
            .unwrap_or(0)
    }

    /// Returns true if no collections have been loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Returns the collection at `index`.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] for an invalid index.
    pub fn collection(&self, index: usize) -> Result<&ReadOutCollection> {
        self.collections
            .get(index)
            .ok_or_else(|| Error::out_of_range("collection", index, self.collections.len()))
    }

    /// Returns a mutable reference to the collection at `index`.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] for an invalid index.
    pub fn collection_mut(&mut self, index: usize) -> Result<&mut ReadOutCollection> {
        let count = self.collections.len();
        self.collections
            .get_mut(index)
            .ok_or_else(|| Error::out_of_range("collection", index, count))
    }

    /// Returns the collection for `channel_id`, inserting an empty one in
    /// first-appearance order if it does not exist yet.
    pub fn collection_for_channel(&mut self, channel_id: u32) -> &mut ReadOutCollection {
        if let Some(pos) = self
            .collections
            .iter()
            .position(|c| c.channel_id() == channel_id)
        {
            &mut self.collections[pos]
        } else {
            self.collections.push(ReadOutCollection::new(channel_id));
            self.collections.last_mut().expect("just pushed")
        }
    }

    /// Appends one sample to `(channel_id, group_index)`, creating the
    /// collection and group as needed.
    pub fn add_sample(
        &mut self,
        channel_id: u32,
        group_index: usize,
        amplitude: f64,
        lines: &[SpectralLine],
    ) {
        self.collection_for_channel(channel_id)
            .group_or_insert(group_index, lines)
            .push(amplitude);
    }

    /// Merges another store into this one. Collections with matching
    /// channel ids are appended sample-wise; new channel ids keep their
    /// relative order. Merging per-file stores in file order makes the
    /// final collection indexing independent of worker scheduling.
    pub fn merge(&mut self, other: &ReadOutStore) {
        for collection in &other.collections {
            self.collection_for_channel(collection.channel_id())
                .append(collection);
        }
    }

    /// Iterates over the collections in index order.
    pub fn collections(&self) -> impl Iterator<Item = &ReadOutCollection> {
        self.collections.iter()
    }

    /// Discards all collections.
    pub fn clear(&mut self) {
        self.collections.clear();
    }
}
