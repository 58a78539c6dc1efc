//! Bitmap data structure helper.

use std::fmt;

use crate::utils::CanopyError;

use fixedbitset::FixedBitSet;

/// Compact replica ID -> bool map. The replica core keeps one of these per
/// concern: which backups acked the in-flight op, and which peers'
/// view-change or recovery messages have been counted already (dedup).
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap(FixedBitSet);

impl Bitmap {
    /// Creates a new bitmap sized to the replica group. If `ones` is true,
    /// all slots are marked true initially; otherwise, all slots are
    /// initially false.
    pub fn new(size: u8, ones: bool) -> Self {
        if size == 0 {
            panic!("replica group of size 0 makes no sense");
        }
        let mut bitset = FixedBitSet::with_capacity(size as usize);

        if ones {
            bitset.set_range(.., true);
        }

        Bitmap(bitset)
    }

    /// Sets bit at index to given flag.
    #[inline]
    pub fn set(&mut self, idx: u8, flag: bool) -> Result<(), CanopyError> {
        if idx as usize >= self.0.len() {
            return Err(CanopyError(format!(
                "replica {} outside group of {}",
                idx,
                self.0.len()
            )));
        }
        self.0.set(idx as usize, flag);
        Ok(())
    }

    /// Gets the bit flag at index.
    #[inline]
    pub fn get(&self, idx: u8) -> Result<bool, CanopyError> {
        if idx as usize >= self.0.len() {
            return Err(CanopyError(format!(
                "replica {} outside group of {}",
                idx,
                self.0.len()
            )));
        }
        Ok(self.0[idx as usize])
    }

    /// Clears all bits back to false, e.g. when a fresh op goes in flight
    /// or view-change scratch state is reset.
    #[inline]
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Returns the size of the bitmap.
    #[inline]
    pub fn size(&self) -> u8 {
        self.0.len() as u8
    }

    /// Returns the number of trues in the bitmap.
    #[inline]
    pub fn count(&self) -> u8 {
        self.0.count_ones(..) as u8
    }

    /// Allows `for (id, bit) in map.iter()`.
    #[inline]
    pub fn iter(&self) -> BitmapIter {
        BitmapIter { map: self, idx: 0 }
    }
}

/// Iterator over `Bitmap`, yielding `(id, bit)` pairs.
#[derive(Debug, Clone)]
pub struct BitmapIter<'m> {
    map: &'m Bitmap,
    idx: usize,
}

impl Iterator for BitmapIter<'_> {
    type Item = (u8, bool);

    fn next(&mut self) -> Option<Self::Item> {
        let id: u8 = self.idx as u8;
        if id < self.map.size() {
            self.idx += 1;
            Some((id, self.map.get(id).unwrap()))
        } else {
            None
        }
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; [", self.size())?;
        let mut first_idx = true;
        for i in self
            .iter()
            .filter_map(|(i, flag)| if flag { Some(i) } else { None })
        {
            if !first_idx {
                write!(f, ", {}", i)?;
            } else {
                write!(f, "{}", i)?;
                first_idx = false;
            }
        }
        write!(f, "]}}")
    }
}

#[cfg(test)]
mod bitmap_tests {
    use super::*;

    #[test]
    #[should_panic]
    fn empty_group_rejected() {
        Bitmap::new(0, false);
    }

    #[test]
    fn ack_set_counts_toward_quorum() -> Result<(), CanopyError> {
        // 5-replica group, f = 2: the master needs acks from 2 peers
        let mut acks = Bitmap::new(5, false);
        assert_eq!(acks.count(), 0);

        acks.set(3, true)?;
        assert_eq!(acks.count(), 1);
        acks.set(1, true)?;
        assert_eq!(acks.count(), 2); // plus the master itself = quorum

        // the dedup check the core performs before counting an ack
        assert_eq!(acks.get(3), Ok(true));
        assert_eq!(acks.get(4), Ok(false));
        Ok(())
    }

    #[test]
    fn out_of_group_replica_rejected() {
        let mut acks = Bitmap::new(3, false);
        assert!(acks.set(3, true).is_err());
        assert!(acks.get(7).is_err());
        assert_eq!(acks.count(), 0);
    }

    #[test]
    fn cleared_for_next_in_flight_op() -> Result<(), CanopyError> {
        let mut acks = Bitmap::new(3, false);
        acks.set(1, true)?;
        acks.set(2, true)?;
        assert_eq!(acks.count(), 2);

        // the next op starts with an empty ack set
        acks.clear();
        assert_eq!(acks.count(), 0);
        assert_eq!(acks.get(1), Ok(false));
        assert_eq!(acks.size(), 3);
        Ok(())
    }

    #[test]
    fn iter_yields_outstanding_peers() -> Result<(), CanopyError> {
        // start from "everyone outstanding" and mark replica 1 as heard
        let mut outstanding = Bitmap::new(3, true);
        outstanding.set(1, false)?;

        let still_waiting: Vec<u8> = outstanding
            .iter()
            .filter_map(|(id, flag)| if flag { Some(id) } else { None })
            .collect();
        assert_eq!(still_waiting, vec![0, 2]);
        Ok(())
    }
}
