// SPDX-License-Identifier: Apache-2.0

//! The one typed, recoverable error surface this crate exposes. The core
//! itself has no recoverable runtime errors beyond these — everything else
//! is either an allocator-reported OOM (propagated as [`Error::Alloc`]) or a
//! programming-error assertion on an unchecked accessor, which stays a
//! `debug_assert!`/UB contract and never returns `Result`.

use lfjson_alloc::AllocError;

/// Failure modes surfaced by this crate's checked ("safe") accessors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A checked indexed or keyed access landed past the container's size.
    #[error("index or key out of range")]
    OutOfRange,

    /// A checked typed accessor was called on a cell of a different tag.
    #[error("value cell has an incompatible tag for this accessor")]
    WrongTag,

    /// The base allocator could not satisfy a request.
    #[error("allocation failed")]
    Alloc(#[from] AllocError),

    /// A string's length would exceed the pool's 2^30 - 1 cap.
    #[error("string length exceeds the 2^30 - 1 cap")]
    StringTooLong,

    /// `Cursor::swap` was asked to exchange two cells in an ancestor/
    /// descendant relationship, which would silently detach a subtree.
    /// This crate rejects the operation outright rather than leave a
    /// dangling or unreachable cell behind.
    #[error("swap would detach a subtree (ancestor/descendant cells)")]
    DetachedSwap,
}

/// Convenience alias for this crate's fallible operations.
pub type Result<T> = core::result::Result<T, Error>;
