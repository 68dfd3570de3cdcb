//! This crate implements a compact heap allocator for microcontrollers with
//! a single region of static RAM.
//!
//!  - **Small bookkeeping.** The region is divided into 8-byte blocks
//!    identified by 15-bit indices. A used run costs four bytes of header,
//!    and a free run stores its free list links in its own body.
//!
//!  - **Adjacent free runs are always coalesced.** Freed memory is merged
//!    with its free neighbors right away, and resizing grows a run in place
//!    whenever a neighbor is free.
//!
//!  - **Optional hardening.** [`Options::POISON`] surrounds every allocation
//!    with canaries and [`Options::INTEGRITY_CHECK`] validates the heap
//!    before every operation. A detected corruption is logged and reported
//!    to a callback, and the operation is refused.
//!
//!  - **This crate supports `#![no_std]`.** [`SharedHeap`] puts a heap behind
//!    a pluggable lock so that it can live in a `static`.
//!
//! # Examples
//!
//! ```rust
//! use bixheap::Heap;
//! use std::mem::MaybeUninit;
//!
//! let mut pool = [MaybeUninit::uninit(); 4096];
//! let mut heap: Heap = Heap::new(&mut pool).unwrap();
//!
//! unsafe {
//!     let ptr1 = heap.allocate(8).unwrap().cast::<u32>();
//!     let ptr2 = heap.allocate(8).unwrap().cast::<u32>();
//!     ptr1.as_ptr().write(42);
//!     ptr2.as_ptr().write(56);
//!
//!     let ptr1 = heap.resize(Some(ptr1.cast()), 64).unwrap().cast::<u32>();
//!     assert_eq!(ptr1.as_ptr().read(), 42);
//!
//!     heap.release(Some(ptr1.cast()));
//!     heap.release(Some(ptr2.cast()));
//! }
//!
//! assert_eq!(heap.info().used_entries, 0);
//! ```
#![no_std]
#![cfg_attr(feature = "doc_cfg", feature(doc_cfg))]

#[cfg(any(test, feature = "std"))]
extern crate std;

mod block;
mod config;
mod global;
mod heap;
mod info;
mod integrity;
pub mod lock;
mod poison;
mod telemetry;
mod utils;

pub use self::{
    block::{BLOCK_SIZE, BODY_SIZE, MAX_BLOCKS},
    config::{CheckedOptions, DefaultOptions, Fit, InitError, Options, RegionConfig},
    global::SharedHeap,
    heap::Heap,
    info::HeapInfo,
    integrity::Corruption,
    poison::PoisonSite,
    telemetry::{LogSink, NoRecorder, Op, OpRecord, Recorder, Sink, Telemetry},
};

#[cfg(test)]
mod tests;
