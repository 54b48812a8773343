//! Binary heap with a contextful comparator
//!
//! The job queues of the counter engine order their elements by expiration
//! time, which is subject to modular wrap-around arithmetic. A plain `Ord`
//! bound can't express that, so the comparator receives a context object
//! carrying the counter characteristics.
use arrayvec::ArrayVec;
use core::ops;

use super::Init;

/// Minimal growable-vector interface implemented by the bounded vector types
/// usable as heap storage.
pub trait VecLike:
    ops::Deref<Target = [<Self as VecLike>::Element]> + ops::DerefMut + Send + Sync + Init + 'static
{
    type Element;
    fn is_empty(&self) -> bool;
    fn len(&self) -> usize;
    fn pop(&mut self) -> Option<Self::Element>;
    fn push(&mut self, x: Self::Element);
}

impl<T: Send + Sync + 'static, const N: usize> VecLike for ArrayVec<T, N> {
    type Element = T;
    fn is_empty(&self) -> bool {
        self.is_empty()
    }
    fn len(&self) -> usize {
        self.len()
    }
    fn pop(&mut self) -> Option<Self::Element> {
        self.pop()
    }
    fn push(&mut self, x: Self::Element) {
        self.push(x)
    }
}

/// Context type for [`BinaryHeap`]'s operations.
pub trait BinaryHeapCtx<Element> {
    /// Return `true` iff `x < y`.
    fn lt(&mut self, x: &Element, y: &Element) -> bool;
}

impl<T: Ord> BinaryHeapCtx<T> for () {
    fn lt(&mut self, x: &T, y: &T) -> bool {
        *x < *y
    }
}

/// Min-heap.
pub trait BinaryHeap: VecLike {
    /// Remove the least item from the heap and return it.
    fn heap_pop(&mut self, ctx: impl BinaryHeapCtx<Self::Element>) -> Option<Self::Element>;

    /// Remove the item at the specified position and return it.
    fn heap_remove(
        &mut self,
        i: usize,
        ctx: impl BinaryHeapCtx<Self::Element>,
    ) -> Option<Self::Element>;

    /// Push an item onto the heap and return its position.
    fn heap_push(&mut self, item: Self::Element, ctx: impl BinaryHeapCtx<Self::Element>) -> usize;
}

impl<T: VecLike> BinaryHeap for T {
    fn heap_pop(&mut self, ctx: impl BinaryHeapCtx<Self::Element>) -> Option<Self::Element> {
        self.heap_remove(0, ctx)
    }

    fn heap_remove(
        &mut self,
        i: usize,
        mut ctx: impl BinaryHeapCtx<Self::Element>,
    ) -> Option<Self::Element> {
        if i >= self.len() {
            return None;
        }

        let mut item = self.pop().unwrap();
        let slice = &mut **self;
        if i < slice.len() {
            // Swap the last item with the item at `i`, then restore the heap
            // invariant around `i`
            core::mem::swap(&mut slice[i], &mut item);

            let should_sift_up = i > 0 && ctx.lt(&slice[i], &slice[(i - 1) / 2]);
            if should_sift_up {
                sift_up(slice, i, ctx);
            } else {
                sift_down(slice, i, ctx);
            }
        }
        Some(item)
    }

    fn heap_push(&mut self, item: Self::Element, ctx: impl BinaryHeapCtx<Self::Element>) -> usize {
        let i = self.len();
        self.push(item);
        sift_up(&mut **self, i, ctx)
    }
}

/// Move the element at `pos` up the heap while it's less than its parent.
/// Returns the final position.
fn sift_up<Element>(
    this: &mut [Element],
    pos: usize,
    mut ctx: impl BinaryHeapCtx<Element>,
) -> usize {
    let mut pos = pos;
    while pos > 0 {
        let parent = (pos - 1) / 2;
        if !ctx.lt(&this[pos], &this[parent]) {
            break;
        }
        this.swap(pos, parent);
        pos = parent;
    }
    pos
}

/// Move the element at `pos` down the heap while any of its children is less
/// than it.
fn sift_down<Element>(this: &mut [Element], pos: usize, mut ctx: impl BinaryHeapCtx<Element>) {
    let end = this.len();
    let mut pos = pos;
    let mut child = 2 * pos + 1;
    while child < end {
        let right = child + 1;
        // compare with the lesser of the two children
        if right < end && !ctx.lt(&this[child], &this[right]) {
            child = right;
        }

        // if we are already in order, stop.
        if !ctx.lt(&this[child], &this[pos]) {
            break;
        }

        this.swap(pos, child);
        pos = child;
        child = 2 * pos + 1;
    }
}
