//! Heap walk filters.
//!
//! The four bits form two independent pairs. Within a pair, setting
//! exactly one bit selects that half of the heap; setting neither or both
//! applies no restriction. Each pair therefore partitions the live set:
//! every object is admitted by exactly one of `INCLUDE_TAGGED` and
//! `INCLUDE_UNTAGGED`.

use bitflags::bitflags;

bitflags! {
    /// Tag-state filter for [`Heap::iterate`](crate::Heap::iterate).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HeapFilter: u32 {
        /// Objects with a non-zero tag.
        const INCLUDE_TAGGED = 1 << 0;
        /// Objects with a zero tag.
        const INCLUDE_UNTAGGED = 1 << 1;
        /// Objects whose class mirror has a non-zero tag.
        const INCLUDE_TAGGED_CLASS = 1 << 2;
        /// Objects whose class mirror has a zero tag.
        const INCLUDE_UNTAGGED_CLASS = 1 << 3;
    }
}

impl HeapFilter {
    /// Whether an object with `tag` whose class has `class_tag` passes.
    #[inline]
    pub fn admits(self, tag: u64, class_tag: u64) -> bool {
        pair_admits(
            self.contains(Self::INCLUDE_TAGGED),
            self.contains(Self::INCLUDE_UNTAGGED),
            tag,
        ) && pair_admits(
            self.contains(Self::INCLUDE_TAGGED_CLASS),
            self.contains(Self::INCLUDE_UNTAGGED_CLASS),
            class_tag,
        )
    }
}

#[inline]
fn pair_admits(tagged: bool, untagged: bool, tag: u64) -> bool {
    match (tagged, untagged) {
        (true, false) => tag != 0,
        (false, true) => tag == 0,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_admits_everything() {
        let f = HeapFilter::empty();
        assert!(f.admits(0, 0));
        assert!(f.admits(5, 7));
    }

    #[test]
    fn test_tag_pair_partitions() {
        for tag in [0u64, 1, 42] {
            let tagged = HeapFilter::INCLUDE_TAGGED.admits(tag, 0);
            let untagged = HeapFilter::INCLUDE_UNTAGGED.admits(tag, 0);
            assert!(tagged ^ untagged);
        }
    }

    #[test]
    fn test_both_bits_is_unrestricted() {
        let f = HeapFilter::INCLUDE_TAGGED | HeapFilter::INCLUDE_UNTAGGED;
        assert!(f.admits(0, 0));
        assert!(f.admits(9, 0));
    }

    #[test]
    fn test_class_pair_is_independent() {
        let f = HeapFilter::INCLUDE_TAGGED | HeapFilter::INCLUDE_UNTAGGED_CLASS;
        assert!(f.admits(3, 0));
        assert!(!f.admits(3, 1));
        assert!(!f.admits(0, 0));
    }
}
