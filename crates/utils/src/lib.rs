#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

// Re-export spin types as the workspace lock API.
pub use spin::{Lazy, Once};
pub use spin::{Mutex, MutexGuard};
pub use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

// Re-export hashbrown collections; every kernel table is keyed by an
// integer id, so the default ahash is fine.
pub use hashbrown::{HashMap, HashSet};

use alloc::vec::Vec;

/// Resizable bit-set id allocator.
///
/// Backs the pid/tid/sid/fd number spaces: [`alloc`](Bitmap::alloc)
/// always returns the lowest clear index and a freed index becomes
/// reusable immediately, so callers must re-validate an id against
/// the owning table before dereferencing it.
#[derive(Default)]
pub struct Bitmap {
    words: Vec<u64>,
}

impl Bitmap {
    pub const fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// [B1] Claims and returns the lowest clear index, growing the
    /// backing store when every current index is set.
    pub fn alloc(&mut self) -> usize {
        for (w, word) in self.words.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                *word |= 1 << bit;
                return w * 64 + bit;
            }
        }
        self.words.push(1);
        (self.words.len() - 1) * 64
    }

    /// [B2] Sets an explicit index, growing as needed. Returns false
    /// when the bit was already set.
    pub fn set(&mut self, index: usize) -> bool {
        let word = index / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let mask = 1u64 << (index % 64);
        if self.words[word] & mask != 0 {
            return false;
        }
        self.words[word] |= mask;
        true
    }

    /// [B3] Clears an index; out-of-range indices are ignored.
    pub fn clear(&mut self, index: usize) {
        if let Some(word) = self.words.get_mut(index / 64) {
            *word &= !(1 << (index % 64));
        }
    }

    /// [B4] Tests an index; anything past the backing store is clear.
    pub fn test(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .is_some_and(|word| word & (1 << (index % 64)) != 0)
    }

    /// [B5] Copies the set bits of `self` into a fresh bitmap.
    pub fn duplicate(&self) -> Self {
        Self {
            words: self.words.clone(),
        }
    }

    /// Upper bound of the index space currently backed.
    pub fn capacity(&self) -> usize {
        self.words.len() * 64
    }

    /// Iterator over the set indices, ascending.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(w, word)| {
            (0..64).filter_map(move |bit| (word & (1 << bit) != 0).then_some(w * 64 + bit))
        })
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
