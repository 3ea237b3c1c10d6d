//! Intrusive handle lists backing the registries.
//!
//! [`HandleList`] is a doubly-linked list of boxed nodes addressed by
//! [`NonNull`] handles, giving registration APIs O(1) unlink of a handle
//! their caller holds. It is only ever touched under the owning registry
//! lock.
//!
//! [`RcuList`] is the RCU-safe variant used for the statedump handle list:
//! mutations stay serialized by the statedump lock, while the agent thread
//! traverses the chain concurrently inside an RCU read section. A removed
//! node keeps its forward link so concurrent readers can walk past it; the
//! remover frees it only after a grace period.

use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

// =============================================================================
// Plain Doubly-Linked List
// =============================================================================

pub(crate) struct Node<T> {
    prev: *mut Node<T>,
    next: *mut Node<T>,
    pub(crate) data: T,
}

pub(crate) struct HandleList<T> {
    head: *mut Node<T>,
    tail: *mut Node<T>,
}

// The raw links never leave the list; nodes travel with their data.
unsafe impl<T: Send> Send for HandleList<T> {}

impl<T> HandleList<T> {
    pub(crate) const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    /// Append `data` and return the node handle for later removal.
    pub(crate) fn push_back(&mut self, data: T) -> NonNull<Node<T>> {
        let node = Box::into_raw(Box::new(Node {
            prev: self.tail,
            next: ptr::null_mut(),
            data,
        }));
        if self.tail.is_null() {
            self.head = node;
        } else {
            unsafe { (*self.tail).next = node };
        }
        self.tail = node;
        unsafe { NonNull::new_unchecked(node) }
    }

    /// Unlink `node` and reclaim it, returning its data.
    ///
    /// # Safety
    ///
    /// `node` must have come from `push_back` on this list and must not
    /// have been removed before.
    pub(crate) unsafe fn remove(&mut self, node: NonNull<Node<T>>) -> T {
        let node = node.as_ptr();
        unsafe {
            let prev = (*node).prev;
            let next = (*node).next;
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if next.is_null() {
                self.tail = prev;
            } else {
                (*next).prev = prev;
            }
            Box::from_raw(node).data
        }
    }

    /// Detach and return the first element, if any.
    pub(crate) fn pop_front(&mut self) -> Option<T> {
        NonNull::new(self.head).map(|head| unsafe { self.remove(head) })
    }

    pub(crate) fn iter(&self) -> Iter<'_, T> {
        Iter {
            cursor: self.head,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for HandleList<T> {
    fn drop(&mut self) {
        while self.pop_front().is_some() {}
    }
}

pub(crate) struct Iter<'a, T> {
    cursor: *mut Node<T>,
    _marker: PhantomData<&'a Node<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        NonNull::new(self.cursor).map(|node| {
            let node = unsafe { node.as_ref() };
            self.cursor = node.next;
            &node.data
        })
    }
}

// =============================================================================
// RCU-Safe List
// =============================================================================

pub(crate) struct RcuNode<T> {
    next: AtomicPtr<RcuNode<T>>,
    pub(crate) data: T,
}

pub(crate) struct RcuList<T> {
    head: AtomicPtr<RcuNode<T>>,
}

impl<T> RcuList<T> {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Append `data`. The caller holds the writer lock.
    pub(crate) fn push_back(&self, data: T) -> NonNull<RcuNode<T>> {
        let node = Box::into_raw(Box::new(RcuNode {
            next: AtomicPtr::new(ptr::null_mut()),
            data,
        }));
        let mut link = &self.head;
        loop {
            let current = link.load(Ordering::Relaxed);
            if current.is_null() {
                break;
            }
            link = unsafe { &(*current).next };
        }
        link.store(node, Ordering::Release);
        unsafe { NonNull::new_unchecked(node) }
    }

    /// Unlink `node` without reclaiming it. The caller holds the writer
    /// lock and frees the node with [`RcuList::into_box`] after a grace
    /// period.
    ///
    /// # Safety
    ///
    /// `node` must be linked on this list.
    pub(crate) unsafe fn remove(&self, node: NonNull<RcuNode<T>>) {
        let target = node.as_ptr();
        let mut link = &self.head;
        loop {
            let current = link.load(Ordering::Relaxed);
            assert!(!current.is_null(), "node is not on the list");
            if current == target {
                // Readers already past this link keep following the
                // removed node's intact forward pointer.
                let next = unsafe { (*target).next.load(Ordering::Relaxed) };
                link.store(next, Ordering::Release);
                return;
            }
            link = unsafe { &(*current).next };
        }
    }

    /// Reclaim a node removed with [`RcuList::remove`].
    ///
    /// # Safety
    ///
    /// A grace period must have elapsed since the removal, and the node
    /// must not be reclaimed twice.
    pub(crate) unsafe fn into_box(node: NonNull<RcuNode<T>>) -> Box<RcuNode<T>> {
        unsafe { Box::from_raw(node.as_ptr()) }
    }

    /// Traverse the list. The caller either holds the writer lock or is
    /// inside a read section of the protecting RCU domain.
    pub(crate) fn iter(&self) -> RcuIter<'_, T> {
        RcuIter {
            cursor: self.head.load(Ordering::Acquire),
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for RcuList<T> {
    fn drop(&mut self) {
        let mut cursor = self.head.load(Ordering::Relaxed);
        while let Some(node) = NonNull::new(cursor) {
            cursor = unsafe { node.as_ref() }.next.load(Ordering::Relaxed);
            drop(unsafe { Box::from_raw(node.as_ptr()) });
        }
    }
}

pub(crate) struct RcuIter<'a, T> {
    cursor: *mut RcuNode<T>,
    _marker: PhantomData<&'a RcuNode<T>>,
}

impl<'a, T> Iterator for RcuIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        NonNull::new(self.cursor).map(|node| {
            let node = unsafe { node.as_ref() };
            self.cursor = node.next.load(Ordering::Acquire);
            &node.data
        })
    }
}
