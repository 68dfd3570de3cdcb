//! Heap configuration
use core::fmt;

/// The free run selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
    /// Take the first free run that is large enough.
    First,
    /// Take the smallest free run that is large enough. Among equally sized
    /// candidates, the one found first in the free list wins.
    Best,
}

/// Compile-time parameters of a [`Heap`](crate::Heap).
///
/// # Examples
///
/// ```
/// use bixheap::{Fit, Options};
///
/// enum Paranoid {}
///
/// impl Options for Paranoid {
///     const FIT: Fit = Fit::First;
///     const POISON: bool = true;
///     const INTEGRITY_CHECK: bool = true;
/// }
/// ```
pub trait Options {
    /// The free run selection policy.
    const FIT: Fit = Fit::Best;

    /// Surround every allocation with canaries and remember its exact size.
    ///
    /// Costs 12 bytes per allocation and a sweep over all used runs on every
    /// mutating call.
    const POISON: bool = false;

    /// Validate the block ring and the free list before every mutating call.
    ///
    /// Takes time linear in the number of runs.
    const INTEGRITY_CHECK: bool = false;
}

/// Best fit, no checks.
#[derive(Debug)]
pub enum DefaultOptions {}

impl Options for DefaultOptions {}

/// Best fit with poisoning and integrity checking, meant for debug builds.
#[derive(Debug)]
pub enum CheckedOptions {}

impl Options for CheckedOptions {
    const POISON: bool = true;
    const INTEGRITY_CHECK: bool = true;
}

/// The memory region a [`SharedHeap`](crate::SharedHeap) manages, usually
/// provided by the linker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionConfig {
    /// The starting address.
    pub base: usize,
    /// The length in bytes.
    pub len: usize,
}

/// The error type returned when a heap can't be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// The region starts at address zero.
    NullBase,
    /// The region can't hold the sentinel, the terminator, and one free
    /// block after alignment.
    TooSmall { len: usize },
    /// The shared heap has already been initialized.
    AlreadyInitialized,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NullBase => f.write_str("heap region starts at null"),
            Self::TooSmall { len } => write!(f, "heap region of {} bytes is too small", len),
            Self::AlreadyInitialized => f.write_str("heap is already initialized"),
        }
    }
}

#[cfg(feature = "std")]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
impl std::error::Error for InitError {}
