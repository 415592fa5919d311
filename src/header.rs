use std::{mem, ptr::NonNull};

use crate::{align::align, list::Node};

/// Region headers are written at the start of each mapped region and linked
/// together, so they are linked list nodes. This is just a type alias that we
/// use when we want to refer to a region header without thinking about linked
/// list nodes.
pub(crate) type Header<T> = Node<T>;

impl<T> Header<T> {
    /// Distance in bytes from the header to the content that follows it. The
    /// header is padded up to the alignment unit so that the content starts
    /// aligned as long as the header itself is.
    ///
    /// ```text
    /// +-------------+
    /// |  Header<T>  | <- Header address.
    /// +-------------+
    /// |   Padding   |
    /// +-------------+
    /// |   Content   | <- Header address + content_offset().
    /// +-------------+
    /// |     ...     |
    /// +-------------+
    /// ```
    #[inline]
    pub const fn content_offset() -> usize {
        align(mem::size_of::<Self>())
    }

    /// Returns the address right after the padded header.
    ///
    /// # Safety
    ///
    /// `header` must be the start of a mapping that extends at least
    /// [`Self::content_offset`] bytes.
    #[inline]
    pub unsafe fn content_address_of(header: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(header.cast::<u8>().as_ptr().add(Self::content_offset()))
    }
}
