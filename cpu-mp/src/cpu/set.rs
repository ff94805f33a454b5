// SPDX-License-Identifier: MPL-2.0

//! This module contains the implementation of the CPU set.

use smallvec::SmallVec;

use super::CpuId;

/// A set of processor handles.
///
/// It is used to report the processors that failed a dispatch. The set grows
/// on demand, so it does not need to know the number of processors upfront.
#[derive(Clone, Debug, Default)]
pub struct CpuSet {
    // A bitset representing the CPUs in the set.
    bits: SmallVec<[InnerPart; NR_PARTS_NO_ALLOC]>,
}

type InnerPart = u64;

const BITS_PER_PART: usize = InnerPart::BITS as usize;
const NR_PARTS_NO_ALLOC: usize = 2;

const fn part_idx(cpu_id: CpuId) -> usize {
    cpu_id.as_usize() / BITS_PER_PART
}

const fn bit_idx(cpu_id: CpuId) -> usize {
    cpu_id.as_usize() % BITS_PER_PART
}

impl CpuSet {
    /// Creates a new empty `CpuSet`.
    pub fn new_empty() -> Self {
        Self {
            bits: SmallVec::new(),
        }
    }

    /// Adds a CPU to the set.
    pub fn add(&mut self, cpu_id: CpuId) {
        let part_idx = part_idx(cpu_id);
        let bit_idx = bit_idx(cpu_id);
        if part_idx >= self.bits.len() {
            self.bits.resize(part_idx + 1, 0);
        }
        self.bits[part_idx] |= 1 << bit_idx;
    }

    /// Removes a CPU from the set.
    pub fn remove(&mut self, cpu_id: CpuId) {
        let part_idx = part_idx(cpu_id);
        let bit_idx = bit_idx(cpu_id);
        if part_idx < self.bits.len() {
            self.bits[part_idx] &= !(1 << bit_idx);
        }
    }

    /// Returns true if the set contains the specified CPU.
    pub fn contains(&self, cpu_id: CpuId) -> bool {
        let part_idx = part_idx(cpu_id);
        let bit_idx = bit_idx(cpu_id);
        part_idx < self.bits.len() && (self.bits[part_idx] & (1 << bit_idx)) != 0
    }

    /// Returns the number of CPUs in the set.
    pub fn count(&self) -> usize {
        self.bits
            .iter()
            .map(|part| part.count_ones() as usize)
            .sum()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|part| *part == 0)
    }

    /// Removes all CPUs from the set.
    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    /// Iterates over the CPUs in the set.
    ///
    /// The order of the iteration is guaranteed to be in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.bits.iter().enumerate().flat_map(|(part_idx, &part)| {
            (0..BITS_PER_PART).filter_map(move |bit_idx| {
                if (part & (1 << bit_idx)) != 0 {
                    Some(CpuId::new((part_idx * BITS_PER_PART + bit_idx) as u32))
                } else {
                    None
                }
            })
        })
    }
}

impl From<CpuId> for CpuSet {
    fn from(cpu_id: CpuId) -> Self {
        let mut set = Self::new_empty();
        set.add(cpu_id);
        set
    }
}

// Sets may carry trailing zeroed parts, so compare members instead of words.
impl PartialEq for CpuSet {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

impl Eq for CpuSet {}

impl FromIterator<CpuId> for CpuSet {
    fn from_iter<I: IntoIterator<Item = CpuId>>(iter: I) -> Self {
        let mut set = Self::new_empty();
        for cpu_id in iter {
            set.add(cpu_id);
        }
        set
    }
}

impl Extend<CpuId> for CpuSet {
    fn extend<I: IntoIterator<Item = CpuId>>(&mut self, iter: I) {
        for cpu_id in iter {
            self.add(cpu_id);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_remove_contains() {
        let mut set = CpuSet::new_empty();
        assert!(set.is_empty());

        set.add(CpuId::new(3));
        set.add(CpuId::new(130));
        assert!(set.contains(CpuId::new(3)));
        assert!(set.contains(CpuId::new(130)));
        assert!(!set.contains(CpuId::new(4)));
        assert_eq!(set.count(), 2);

        set.remove(CpuId::new(3));
        assert!(!set.contains(CpuId::new(3)));
        assert_eq!(set.count(), 1);

        // Removing a CPU beyond the allocated parts is a no-op.
        set.remove(CpuId::new(1000));
        assert_eq!(set.count(), 1);

        set.clear();
        assert!(set.is_empty());
    }

    #[test]
    fn iterates_in_ascending_order() {
        let set: CpuSet = [70, 2, 64, 0, 5]
            .into_iter()
            .map(CpuId::new)
            .collect();
        let ids: Vec<u32> = set.iter().map(CpuId::as_u32).collect();
        assert_eq!(ids, vec![0, 2, 5, 64, 70]);
    }

    #[test]
    fn equality_ignores_trailing_parts() {
        let mut a = CpuSet::from(CpuId::new(1));
        let mut b = CpuSet::from(CpuId::new(1));
        b.add(CpuId::new(200));
        b.remove(CpuId::new(200));
        assert_eq!(a, b);

        a.extend([CpuId::new(2)]);
        assert_ne!(a, b);
        assert_eq!(a.count(), 2);
    }
}
