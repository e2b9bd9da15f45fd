//! Fixed-width set of acknowledged fragment positions.

use bincode::{Decode, Encode};

use super::{FragmentIndex, MAX_FRAGMENTS};

/// Bitmap with one bit per fragment index, bit `n` set once fragment `n` has
/// been received.
///
/// # Examples
///
/// ```
/// use fragmentation::fragment::{AckBitmap, FragmentIndex};
/// let mut bitmap = AckBitmap::empty();
/// bitmap.insert(FragmentIndex::new(2));
/// assert!(bitmap.contains(FragmentIndex::new(2)));
/// assert_eq!(bitmap.len(), 1);
/// assert!(AckBitmap::full(3).is_superset_of(bitmap));
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Encode, Decode)]
pub struct AckBitmap(u64);

impl AckBitmap {
    /// Bitmap with no fragment acknowledged.
    #[must_use]
    pub const fn empty() -> Self { Self(0) }

    /// Bitmap with the lowest `count` fragments acknowledged.
    ///
    /// Counts above [`MAX_FRAGMENTS`] saturate to a fully set bitmap.
    #[must_use]
    pub const fn full(count: usize) -> Self {
        if count >= MAX_FRAGMENTS {
            Self(u64::MAX)
        } else {
            Self((1_u64 << count) - 1)
        }
    }

    /// Wrap raw bits.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self { Self(bits) }

    /// Return the raw bits.
    #[must_use]
    pub const fn bits(self) -> u64 { self.0 }

    /// Mark `index` as received. Indices outside the bitmap are ignored.
    pub fn insert(&mut self, index: FragmentIndex) {
        if index.is_addressable() {
            self.0 |= 1 << index.get();
        }
    }

    /// Whether `index` is marked as received.
    #[must_use]
    pub const fn contains(self, index: FragmentIndex) -> bool {
        index.is_addressable() && self.0 & (1 << index.get()) != 0
    }

    /// Number of set bits.
    #[must_use]
    pub const fn len(self) -> usize { self.0.count_ones() as usize }

    /// Whether no bit is set.
    #[must_use]
    pub const fn is_empty(self) -> bool { self.0 == 0 }

    /// Bits set in `self` but not in `other`.
    #[must_use]
    pub const fn difference(self, other: Self) -> Self { Self(self.0 & !other.0) }

    /// Bits set in both `self` and `other`.
    #[must_use]
    pub const fn intersection(self, other: Self) -> Self { Self(self.0 & other.0) }

    /// Whether every bit of `other` is also set in `self`.
    #[must_use]
    pub const fn is_superset_of(self, other: Self) -> bool { self.0 & other.0 == other.0 }

    /// Iterate over the set fragment indices in ascending order.
    pub fn iter(self) -> impl Iterator<Item = FragmentIndex> {
        let bits = self.0;
        (0..MAX_FRAGMENTS as u32)
            .filter(move |bit| bits & (1 << bit) != 0)
            .map(FragmentIndex::new)
    }
}
