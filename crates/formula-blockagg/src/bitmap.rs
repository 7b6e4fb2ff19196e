#![forbid(unsafe_code)]

/// A compact bit vector backing selection masks.
///
/// Bits are stored little-endian within each `u64` word:
/// - bit 0 is the LSB of word 0
/// - bit 63 is the MSB of word 0
///
/// Bits past `len` in the last word are always zero, so word-wise operations never need to mask
/// before counting.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BitVec {
    words: Vec<u64>,
    len: usize,
    ones: usize,
}

impl BitVec {
    pub fn with_capacity_bits(bits: usize) -> Self {
        Self {
            words: Vec::with_capacity(bits.div_ceil(64)),
            len: 0,
            ones: 0,
        }
    }

    pub fn with_len_all_true(bits: usize) -> Self {
        let mut words = vec![u64::MAX; bits.div_ceil(64)];
        let rem = bits % 64;
        if rem != 0 {
            if let Some(last) = words.last_mut() {
                *last = (1u64 << rem) - 1;
            }
        }

        Self {
            words,
            len: bits,
            ones: bits,
        }
    }

    pub fn with_len_all_false(bits: usize) -> Self {
        Self {
            words: vec![0u64; bits.div_ceil(64)],
            len: bits,
            ones: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, value: bool) {
        let bit = self.len % 64;
        if bit == 0 {
            self.words.push(0);
        }

        if value {
            self.words[self.len / 64] |= 1u64 << bit;
            self.ones += 1;
        }

        self.len += 1;
    }

    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.len, "BitVec index {index} out of bounds ({})", self.len);
        (self.words[index / 64] >> (index % 64)) & 1 == 1
    }

    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.len, "BitVec index {index} out of bounds ({})", self.len);
        let word = &mut self.words[index / 64];
        let mask = 1u64 << (index % 64);
        let was_set = *word & mask != 0;

        match (was_set, value) {
            (true, false) => {
                *word &= !mask;
                self.ones -= 1;
            }
            (false, true) => {
                *word |= mask;
                self.ones += 1;
            }
            _ => {}
        }
    }

    pub fn count_ones(&self) -> usize {
        self.ones
    }

    pub fn all_true(&self) -> bool {
        self.ones == self.len
    }

    pub fn all_false(&self) -> bool {
        self.ones == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(move |i| (self.words[i / 64] >> (i % 64)) & 1 == 1)
    }

    /// Pairwise AND with a mask of the same length.
    pub fn and_inplace(&mut self, other: &BitVec) {
        assert_eq!(self.len, other.len, "BitVec length mismatch");

        let mut ones = 0usize;
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w &= *o;
            ones += w.count_ones() as usize;
        }
        self.ones = ones;
    }
}

impl FromIterator<bool> for BitVec {
    fn from_iter<I: IntoIterator<Item = bool>>(iter: I) -> Self {
        let iter = iter.into_iter();
        let mut out = Self::with_capacity_bits(iter.size_hint().0);
        for bit in iter {
            out.push(bit);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_true_masks_trailing_bits() {
        let bits = BitVec::with_len_all_true(70);
        assert_eq!(bits.count_ones(), 70);
        assert_eq!(bits.words[1], (1u64 << 6) - 1);
        assert!(bits.all_true());
    }

    #[test]
    fn and_recounts_ones() {
        let mut a: BitVec = [true, true, false, true].into_iter().collect();
        let b: BitVec = [true, false, false, true].into_iter().collect();
        a.and_inplace(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![true, false, false, true]);
        assert_eq!(a.count_ones(), 2);
    }

    #[test]
    fn set_tracks_ones() {
        let mut bits = BitVec::with_len_all_false(130);
        bits.set(129, true);
        bits.set(0, true);
        bits.set(0, false);
        assert_eq!(bits.count_ones(), 1);
        assert!(bits.get(129));
        assert!(!bits.all_false());
    }
}
