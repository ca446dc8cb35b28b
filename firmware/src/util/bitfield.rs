use crate::config::MAX_RING_SECS;

const WORDS: usize = MAX_RING_SECS.div_ceil(32);

/// One bit per sector of a ring buffer
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct SectorBitmap {
    words: [u32; WORDS],
}

impl SectorBitmap {
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    /// Returns a bitmap with the first `count` sectors set
    pub fn with_first(count: usize) -> Self {
        let mut map = Self::new();
        for i in 0..count {
            map.set(i);
        }
        map
    }

    #[inline]
    pub fn get(&self, sector: usize) -> bool {
        self.words[sector / 32] & (1 << (sector % 32)) != 0
    }

    #[inline]
    pub fn set(&mut self, sector: usize) {
        self.words[sector / 32] |= 1 << (sector % 32);
    }

    #[inline]
    pub fn clear(&mut self, sector: usize) {
        self.words[sector / 32] &= !(1 << (sector % 32));
    }

    pub fn any(&self) -> bool {
        self.words.iter().any(|&w| w != 0)
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Finds the first set bit at or after `start`, wrapping around at `len`
    pub fn next_set_wrapping(&self, start: usize, len: usize) -> Option<usize> {
        (0..len).map(|i| (start + i) % len).find(|&i| self.get(i))
    }
}

impl core::fmt::Debug for SectorBitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for word in self.words.iter().rev() {
            write!(f, "{word:08x} ")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::SectorBitmap;
    use crate::config::MAX_RING_SECS;

    use proptest::prelude::*;

    #[test]
    fn with_first_sets_a_prefix() {
        let map = SectorBitmap::with_first(40);

        assert!(map.get(0));
        assert!(map.get(39));
        assert!(!map.get(40));
        assert_eq!(map.count(), 40);
    }

    #[test]
    fn next_set_wraps() {
        let mut map = SectorBitmap::new();
        assert_eq!(map.next_set_wrapping(3, 8), None);

        map.set(1);
        assert_eq!(map.next_set_wrapping(3, 8), Some(1));

        map.set(5);
        assert_eq!(map.next_set_wrapping(3, 8), Some(5));
        assert_eq!(map.next_set_wrapping(5, 8), Some(5));
    }

    proptest! {
        #[test]
        fn set_then_clear_is_empty(bits in prop::collection::vec(0usize..MAX_RING_SECS, 0..64)) {
            let mut map = SectorBitmap::new();
            for &b in &bits {
                map.set(b);
            }
            prop_assert_eq!(map.any(), !bits.is_empty());

            for &b in &bits {
                map.clear(b);
            }
            prop_assert!(!map.any());
        }
    }
}
