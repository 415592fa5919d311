use std::{marker::PhantomData, ptr::NonNull};

use crate::{header::Header, Pointer};

/// Singly linked list node. See also [`Header<T>`].
pub struct Node<T> {
    pub next: Pointer<Self>,
    pub data: T,
}

/// Intrusive singly linked list. Nodes live inside memory that the list
/// doesn't own (they are region headers written at the start of each mapped
/// region), so the list never allocates, it only links addresses it is given.
/// Order is insertion order, which for regions means creation order.
pub struct LinkedList<T> {
    pub head: Pointer<Node<T>>,
    pub tail: Pointer<Node<T>>,
    pub len: usize,
    marker: PhantomData<T>,
}

impl<T> LinkedList<T> {
    /// Creates an empty linked list. No allocations happen because, well, we
    /// are the allocator.
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            marker: PhantomData,
        }
    }

    /// Appends a new node to the end of the list. Since it cannot allocate it
    /// needs the address where the node should be written to.
    ///
    /// # Safety
    ///
    /// `address` must be valid for writes of [`Node<T>`] and suitably aligned.
    pub unsafe fn append(&mut self, data: T, address: NonNull<u8>) -> NonNull<Header<T>> {
        let node = address.cast::<Node<T>>();

        node.as_ptr().write(Node { next: None, data });

        if let Some(mut tail) = self.tail {
            tail.as_mut().next = Some(node);
        } else {
            self.head = Some(node);
        }

        self.tail = Some(node);
        self.len += 1;

        node
    }

    /// Unlinks `node`, fixing up head and tail. Since the list is singly
    /// linked we have to walk it to find the predecessor. Returns `false` if
    /// `node` is not in this list.
    ///
    /// # Safety
    ///
    /// All nodes in the list must be valid.
    pub unsafe fn remove(&mut self, node: NonNull<Node<T>>) -> bool {
        let mut prev: Pointer<Node<T>> = None;
        let mut current = self.head;

        while let Some(candidate) = current {
            if candidate == node {
                let next = candidate.as_ref().next;

                match prev {
                    Some(mut prev) => prev.as_mut().next = next,
                    None => self.head = next,
                }

                if self.tail == Some(node) {
                    self.tail = prev;
                }

                self.len -= 1;
                return true;
            }

            prev = current;
            current = candidate.as_ref().next;
        }

        false
    }

    #[inline]
    pub fn first(&self) -> Pointer<Node<T>> {
        self.head
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates over the nodes. The next link is read before a node is
    /// yielded, so the caller may unlink and even unmap the yielded node.
    pub fn iter(&self) -> Iter<T> {
        Iter {
            current: self.head,
            marker: PhantomData,
        }
    }
}

/// See [`LinkedList::iter`].
pub struct Iter<'a, T> {
    current: Pointer<Node<T>>,
    marker: PhantomData<&'a T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = NonNull<Node<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.current.map(|node| unsafe {
            self.current = node.as_ref().next;
            node
        })
    }
}
