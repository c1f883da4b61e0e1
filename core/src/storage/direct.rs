use super::{RowBuffer, RowInitializer, RowStore};
use crate::error::{EmbeddingError, Result};
use crate::input::EmbeddingKey;
use crate::optim::{OptHyperParams, RowParts, UpdateTarget};

/// Keys `key_start..key_start + size` of one slot, stored from row `row_base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub slot: usize,
    pub key_start: u64,
    pub size: usize,
    pub row_base: usize,
}

impl SlotRange {
    fn row_of(&self, key: u64) -> Option<usize> {
        let off = key.checked_sub(self.key_start)?;
        (off < self.size as u64).then(|| self.row_base + off as usize)
    }
}

/// Directly addressed table for one-hot slots.
///
/// Every key of every assigned slot has a preallocated row, so a lookup is an offset
/// computation and the table never grows.
#[derive(Debug, Clone)]
pub struct DirectTable {
    ranges: Vec<SlotRange>,
    rows: RowBuffer,
}

impl DirectTable {
    /// Allocates the slots in `slots` (indices into `slot_size_array`). Keys of slot `s` start
    /// at the prefix sum of the sizes of slots `0..s`.
    pub fn new(
        slot_size_array: &[usize],
        slots: &[usize],
        vec_size: usize,
        hp: &OptHyperParams,
        init: RowInitializer,
    ) -> Result<Self> {
        let mut key_starts = Vec::with_capacity(slot_size_array.len());
        let mut acc = 0u64;
        for &size in slot_size_array {
            key_starts.push(acc);
            acc += size as u64;
        }
        let mut rows = RowBuffer::new(vec_size, hp);
        let mut ranges = Vec::with_capacity(slots.len());
        for &slot in slots {
            let (Some(&size), Some(&key_start)) =
                (slot_size_array.get(slot), key_starts.get(slot))
            else {
                return Err(EmbeddingError::wrong_input(format!(
                    "slot {slot} not in slot_size_array of {} slots",
                    slot_size_array.len()
                )));
            };
            let row_base = rows.len();
            for key in key_start..key_start + size as u64 {
                rows.push_fresh(&init, key);
            }
            ranges.push(SlotRange {
                slot,
                key_start,
                size,
                row_base,
            });
        }
        Ok(Self { ranges, rows })
    }

    pub fn ranges(&self) -> &[SlotRange] {
        &self.ranges
    }

    /// Row of `key` if it lies in the range of `slot`.
    pub fn row_in_slot(&self, slot: usize, key: u64) -> Option<usize> {
        self.ranges
            .iter()
            .find(|r| r.slot == slot)
            .and_then(|r| r.row_of(key))
    }
}

impl UpdateTarget for DirectTable {
    fn vec_size(&self) -> usize {
        self.rows.vec_size()
    }

    fn occupied_rows(&self) -> Vec<usize> {
        (0..self.rows.len()).collect()
    }

    fn row_parts_mut(&mut self, row: usize) -> Result<RowParts<'_>> {
        self.rows.parts_mut(row)
    }
}

impl<K: EmbeddingKey> RowStore<K> for DirectTable {
    fn capacity(&self) -> usize {
        self.rows.len()
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn find(&self, key: K) -> Option<usize> {
        let key = key.to_u64();
        self.ranges.iter().find_map(|r| r.row_of(key))
    }

    fn find_or_insert(&mut self, key: K) -> Result<usize> {
        RowStore::<K>::find(self, key).ok_or_else(|| {
            EmbeddingError::DataCheck(format!(
                "key {key:?} is outside every slot range of this one-hot table"
            ))
        })
    }

    fn insert_row(&mut self, key: K, weight: &[f32], state: &[f32], updates: u64) -> Result<()> {
        let row = RowStore::<K>::find_or_insert(self, key)?;
        self.rows.write(row, weight, state, updates)
    }

    fn rows(&self) -> &RowBuffer {
        &self.rows
    }

    fn entries(&self) -> Vec<(K, usize)> {
        let mut entries: Vec<(K, usize)> = self
            .ranges
            .iter()
            .flat_map(|r| {
                (0..r.size).map(move |i| (K::from_u64(r.key_start + i as u64), r.row_base + i))
            })
            .collect();
        entries.sort_unstable_by_key(|&(k, _)| k);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::OptimizerType;

    fn table() -> DirectTable {
        // slots of sizes [3, 2, 4]; this table owns slots 0 and 2
        DirectTable::new(
            &[3, 2, 4],
            &[0, 2],
            2,
            &OptHyperParams::default_for(OptimizerType::Sgd),
            RowInitializer::zeros(),
        )
        .unwrap()
    }

    #[test]
    fn test_addressing() {
        let t = table();
        assert_eq!(RowStore::<u64>::len(&t), 7);
        assert_eq!(RowStore::<u64>::find(&t, 0u64), Some(0));
        assert_eq!(RowStore::<u64>::find(&t, 2u64), Some(2));
        // keys 3 and 4 belong to slot 1, owned elsewhere
        assert_eq!(RowStore::<u64>::find(&t, 3u64), None);
        assert_eq!(RowStore::<u64>::find(&t, 5u64), Some(3));
        assert_eq!(RowStore::<u64>::find(&t, 8u64), Some(6));
        assert_eq!(RowStore::<u64>::find(&t, 9u64), None);
        assert_eq!(t.row_in_slot(2, 6), Some(4));
        assert_eq!(t.row_in_slot(0, 6), None);
    }

    #[test]
    fn test_out_of_range_key_is_data_error() {
        let mut t = table();
        let err = RowStore::<u64>::find_or_insert(&mut t, 100u64).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DataCheck);
    }

    #[test]
    fn test_unknown_slot() {
        let r = DirectTable::new(
            &[3],
            &[1],
            2,
            &OptHyperParams::default_for(OptimizerType::Sgd),
            RowInitializer::zeros(),
        );
        assert!(r.is_err());
    }
}
