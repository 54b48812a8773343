//! Bit array structures supporting constant-time highest-priority lookup.
//!
//! Internal priorities are gap-less with `0` representing the logically
//! highest priority, so "find the highest ready priority" is "find the lowest
//! set bit". Instances are not concurrency-safe on their own; callers keep
//! them in CPU-Lock cells.
use core::fmt;
use num_traits::PrimInt;

use super::Init;

/// A bit array indexed by priority.
///
/// All methods panic when the given bit position is out of range.
pub trait PrioBitmap: Init + Send + Sync + Clone + Copy + fmt::Debug + 'static {
    /// Get the bit at the specified position.
    fn get(&self, i: usize) -> bool;

    /// Clear the bit at the specified position.
    fn clear(&mut self, i: usize);

    /// Set the bit at the specified position.
    fn set(&mut self, i: usize);

    /// Get the position of the first (logically highest-priority) set bit.
    fn find_highest(&self) -> Option<usize>;

    /// Return `true` if no bits are set.
    fn is_empty(&self) -> bool {
        self.find_highest().is_none()
    }
}

/// Stores up to `W::BITS` entries in a single machine word.
#[derive(Clone, Copy)]
pub struct OneLevelBitmap<W> {
    bits: W,
}

impl<W: Init> Init for OneLevelBitmap<W> {
    const INIT: Self = Self { bits: W::INIT };
}

impl<W: PrimInt> fmt::Debug for OneLevelBitmap<W> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..bit_width::<W>()).filter(|&i| self.bits & (W::one() << i) != W::zero()))
            .finish()
    }
}

#[inline]
fn bit_width<W>() -> usize {
    core::mem::size_of::<W>() * 8
}

impl<W: PrimInt + Init + Send + Sync + 'static> PrioBitmap for OneLevelBitmap<W> {
    fn get(&self, i: usize) -> bool {
        assert!(i < bit_width::<W>());
        self.bits & (W::one() << i) != W::zero()
    }

    fn clear(&mut self, i: usize) {
        assert!(i < bit_width::<W>());
        self.bits = self.bits & !(W::one() << i);
    }

    fn set(&mut self, i: usize) {
        assert!(i < bit_width::<W>());
        self.bits = self.bits | (W::one() << i);
    }

    fn find_highest(&self) -> Option<usize> {
        let i = self.bits.trailing_zeros() as usize;
        if i == bit_width::<W>() {
            None
        } else {
            Some(i)
        }
    }

    fn is_empty(&self) -> bool {
        self.bits == W::zero()
    }
}

/// Stores `WORD_LEN * LEN` entries using a one-word summary over `LEN` leaf
/// words.
#[derive(Clone, Copy)]
pub struct TwoLevelBitmap<const LEN: usize> {
    // Invariant: `summary & (1 << i) != 0` iff `leaves[i] != 0`
    summary: Word,
    leaves: [Word; LEN],
}

type Word = usize;
const WORD_LEN: usize = Word::BITS as usize;

impl<const LEN: usize> Init for TwoLevelBitmap<LEN> {
    const INIT: Self = Self {
        summary: 0,
        leaves: [0; LEN],
    };
}

impl<const LEN: usize> fmt::Debug for TwoLevelBitmap<LEN> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(self.leaves.iter().enumerate().flat_map(|(leaf_i, &leaf)| {
                (0..WORD_LEN)
                    .filter(move |i| leaf & (1 << i) != 0)
                    .map(move |i| i + leaf_i * WORD_LEN)
            }))
            .finish()
    }
}

impl<const LEN: usize> PrioBitmap for TwoLevelBitmap<LEN> {
    fn get(&self, i: usize) -> bool {
        self.leaves[i / WORD_LEN] & (1 << (i % WORD_LEN)) != 0
    }

    fn clear(&mut self, i: usize) {
        let leaf = &mut self.leaves[i / WORD_LEN];
        *leaf &= !(1 << (i % WORD_LEN));
        if *leaf == 0 {
            self.summary &= !(1 << (i / WORD_LEN));
        }
    }

    fn set(&mut self, i: usize) {
        self.leaves[i / WORD_LEN] |= 1 << (i % WORD_LEN);
        self.summary |= 1 << (i / WORD_LEN);
    }

    fn find_highest(&self) -> Option<usize> {
        let leaf_i = self.summary.trailing_zeros() as usize;
        if leaf_i == WORD_LEN {
            None
        } else {
            let leaf = self.leaves[leaf_i];
            let i = leaf.trailing_zeros() as usize;
            debug_assert_ne!(i, WORD_LEN);
            Some(i + leaf_i * WORD_LEN)
        }
    }

    fn is_empty(&self) -> bool {
        self.summary == 0
    }
}
