//! Out-of-band metadata attached to stream data.
//!
//! Offsets are byte positions measured across all channels of the port's
//! buffered data. A record at offset `n` applies to the sample that starts at
//! byte `n`; a record whose offset equals the buffered length sits after the
//! last byte (typical for end-of-stream markers).

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

/// Classification of a metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataKind {
    /// Opaque module-defined record.
    Generic,
    /// End of stream. A flushing EOS asks modules to drain internal state.
    EndOfStream {
        /// Whether the marker flushes algorithmic delay.
        flushing: bool,
    },
    /// Data-flow gap: no more data until the stream restarts.
    DataFlowGap,
}

/// One metadata record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Module-defined identifier.
    pub id: u32,
    /// Byte offset across all channels.
    pub offset: u32,
    /// Record classification.
    pub kind: MetadataKind,
    /// Opaque payload.
    pub payload: Vec<u8>,
}

impl Metadata {
    /// Generic record at `offset`.
    pub fn new(id: u32, offset: u32) -> Self {
        Self {
            id,
            offset,
            kind: MetadataKind::Generic,
            payload: Vec::new(),
        }
    }

    /// End-of-stream record at `offset`.
    pub fn eos(offset: u32, flushing: bool) -> Self {
        Self {
            id: 0,
            offset,
            kind: MetadataKind::EndOfStream { flushing },
            payload: Vec::new(),
        }
    }

    /// Data-flow-gap record at `offset`.
    pub fn dfg(offset: u32) -> Self {
        Self {
            id: 0,
            offset,
            kind: MetadataKind::DataFlowGap,
            payload: Vec::new(),
        }
    }

    /// Attaches a payload.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// EOS or DFG.
    pub fn is_eos_or_dfg(&self) -> bool {
        matches!(
            self.kind,
            MetadataKind::EndOfStream { .. } | MetadataKind::DataFlowGap
        )
    }
}

/// Offset-ordered list of metadata records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataList {
    items: Vec<Metadata>,
}

impl MetadataList {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts after every record with an offset `<=` the new one.
    pub fn push(&mut self, md: Metadata) {
        let pos = self.items.partition_point(|m| m.offset <= md.offset);
        self.items.insert(pos, md);
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Records in offset order.
    pub fn iter(&self) -> impl Iterator<Item = &Metadata> {
        self.items.iter()
    }

    /// Removes every record.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Whether a data-flow-gap record is present.
    pub fn has_dfg(&self) -> bool {
        self.items
            .iter()
            .any(|m| m.kind == MetadataKind::DataFlowGap)
    }

    /// Whether a flushing end-of-stream record is present.
    pub fn has_flushing_eos(&self) -> bool {
        self.items
            .iter()
            .any(|m| m.kind == MetadataKind::EndOfStream { flushing: true })
    }

    /// Whether any EOS or DFG record is present.
    pub fn has_eos_or_dfg(&self) -> bool {
        self.items.iter().any(Metadata::is_eos_or_dfg)
    }

    /// Detaches records that fall inside the first `bytes` bytes.
    ///
    /// With `all_consumed` every record leaves, including those sitting at
    /// the end of the data. Records that stay are rebased by `-bytes`.
    pub fn split_front(&mut self, bytes: u32, all_consumed: bool) -> MetadataList {
        let split = if all_consumed {
            self.items.len()
        } else {
            self.items.partition_point(|m| m.offset < bytes)
        };
        let rest = self.items.split_off(split);
        let front = core::mem::replace(&mut self.items, rest);
        self.shift_down(bytes);
        MetadataList { items: front }
    }

    /// Moves all records of `other` behind this list's records, offset by `base`.
    pub fn append_shifted(&mut self, other: MetadataList, base: u32) {
        for mut md in other.items {
            md.offset = md.offset.saturating_add(base);
            self.push(md);
        }
    }

    /// Adds `bytes` to every offset.
    pub fn shift_up(&mut self, bytes: u32) {
        for md in &mut self.items {
            md.offset = md.offset.saturating_add(bytes);
        }
    }

    /// Subtracts `bytes` from every offset, clamping at zero.
    pub fn shift_down(&mut self, bytes: u32) {
        for md in &mut self.items {
            md.offset = md.offset.saturating_sub(bytes);
        }
    }

    /// Rescales offsets from an input span of `from` bytes to `to` bytes.
    pub fn rescale(&mut self, from: u32, to: u32) {
        if from == 0 || from == to {
            return;
        }
        for md in &mut self.items {
            md.offset = (u64::from(md.offset) * u64::from(to) / u64::from(from)) as u32;
        }
    }

    /// Drops records inside the first `bytes` bytes and rebases the rest.
    ///
    /// With `keep_eos`, EOS and DFG records survive at offset 0. Returns the
    /// number of dropped records.
    pub fn drop_within(&mut self, bytes: u32, keep_eos: bool) -> usize {
        let before = self.items.len();
        self.items
            .retain(|m| m.offset >= bytes || (keep_eos && m.is_eos_or_dfg()));
        self.shift_down(bytes);
        before - self.items.len()
    }

    /// Takes every EOS/DFG record out of the list.
    pub fn take_eos_and_dfg(&mut self) -> MetadataList {
        let (eos, rest): (Vec<_>, Vec<_>) = self
            .items
            .drain(..)
            .partition(Metadata::is_eos_or_dfg);
        self.items = rest;
        MetadataList { items: eos }
    }

    /// Moves EOS/DFG records at or past `from` up by `bytes`.
    pub fn shift_markers_from(&mut self, from: u32, bytes: u32) {
        for md in &mut self.items {
            if md.is_eos_or_dfg() && md.offset >= from {
                md.offset = md.offset.saturating_add(bytes);
            }
        }
        self.items.sort_by_key(|m| m.offset);
    }

    /// Clears the flushing flag on every end-of-stream record.
    pub fn make_eos_non_flushing(&mut self) {
        for md in &mut self.items {
            if let MetadataKind::EndOfStream { flushing } = &mut md.kind {
                *flushing = false;
            }
        }
    }
}

impl FromIterator<Metadata> for MetadataList {
    fn from_iter<I: IntoIterator<Item = Metadata>>(iter: I) -> Self {
        let mut list = Self::new();
        for md in iter {
            list.push(md);
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offsets(list: &MetadataList) -> Vec<u32> {
        list.iter().map(|m| m.offset).collect()
    }

    #[test]
    fn push_keeps_offset_order_and_fifo_ties() {
        let mut list = MetadataList::new();
        list.push(Metadata::new(1, 20));
        list.push(Metadata::new(2, 5));
        list.push(Metadata::new(3, 20));
        let ids: Vec<u32> = list.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn split_front_moves_inside_span() {
        let mut list: MetadataList = [Metadata::new(1, 0), Metadata::new(2, 8), Metadata::new(3, 16)]
            .into_iter()
            .collect();
        let front = list.split_front(10, false);
        assert_eq!(offsets(&front), vec![0, 8]);
        assert_eq!(offsets(&list), vec![6]);
    }

    #[test]
    fn split_front_all_takes_tail_markers() {
        let mut list: MetadataList = [Metadata::new(1, 4), Metadata::eos(10, true)]
            .into_iter()
            .collect();
        let front = list.split_front(10, true);
        assert_eq!(front.len(), 2);
        assert!(list.is_empty());
        assert!(front.has_flushing_eos());
    }

    #[test]
    fn drop_within_keeps_eos() {
        let mut list: MetadataList = [Metadata::new(1, 2), Metadata::eos(4, true), Metadata::new(3, 12)]
            .into_iter()
            .collect();
        assert_eq!(list.drop_within(8, true), 1);
        assert_eq!(offsets(&list), vec![0, 4]);
        assert!(list.has_flushing_eos());
    }

    #[test]
    fn rescale_maps_offsets() {
        let mut list: MetadataList = [Metadata::new(1, 10), Metadata::new(2, 40)]
            .into_iter()
            .collect();
        list.rescale(40, 80);
        assert_eq!(offsets(&list), vec![20, 80]);
    }

    #[test]
    fn take_eos_leaves_generic() {
        let mut list: MetadataList = [Metadata::dfg(0), Metadata::new(7, 3)].into_iter().collect();
        let eos = list.take_eos_and_dfg();
        assert!(eos.has_dfg());
        assert_eq!(list.iter().map(|m| m.id).collect::<Vec<_>>(), vec![7]);
    }
}
