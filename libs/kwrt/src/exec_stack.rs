// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Unboxed 64-bit queue backing the interpreter's operand stack.

use alloc::boxed::Box;
use alloc::vec;
use core::fmt;

use static_assertions::const_assert;

use crate::errors::Error;

/// Minimum capacity of an [`ArrayQueue`]. Capacities are always powers of two.
pub const MIN_CAPACITY: usize = 8;

/// The sentinel used by [`ArrayQueue::new`].
pub const DEFAULT_NULL_VALUE: u64 = i64::MIN as u64;

const_assert!(MIN_CAPACITY.is_power_of_two());

/// A circular buffer of `u64` cells addressed by head and tail indices modulo a
/// power-of-two capacity.
///
/// The queue can be used from both ends: `offer`/`poll` give FIFO order,
/// `push`/`pop` give LIFO order. It may be configured with a sentinel ("null
/// value") that marks vacated cells; storing the sentinel is a contract violation
/// and panics.
pub struct ArrayQueue {
    elements: Box<[u64]>,
    head: usize,
    tail: usize,
    null_value: Option<u64>,
}

impl Default for ArrayQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ArrayQueue {
    /// Creates a queue with [`MIN_CAPACITY`] and the [`DEFAULT_NULL_VALUE`] sentinel.
    pub fn new() -> Self {
        Self::with_capacity(MIN_CAPACITY, Some(DEFAULT_NULL_VALUE))
    }

    /// Creates a queue with [`MIN_CAPACITY`] using `null_value` as the sentinel.
    pub fn with_null_value(null_value: u64) -> Self {
        Self::with_capacity(MIN_CAPACITY, Some(null_value))
    }

    /// Creates a queue whose capacity is `initial_capacity` rounded up to the next
    /// power of two (and at least [`MIN_CAPACITY`]).
    ///
    /// Passing `None` as the sentinel allows every bit pattern to be stored.
    pub fn with_capacity(initial_capacity: usize, null_value: Option<u64>) -> Self {
        let capacity = initial_capacity.max(MIN_CAPACITY).next_power_of_two();
        Self {
            elements: vec![null_value.unwrap_or(0); capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            null_value,
        }
    }

    pub fn null_value(&self) -> Option<u64> {
        self.null_value
    }

    pub fn capacity(&self) -> usize {
        self.elements.len()
    }

    pub fn len(&self) -> usize {
        self.tail.wrapping_sub(self.head) & self.mask()
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn clear(&mut self) {
        if self.head != self.tail {
            self.elements.fill(self.fill_value());
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Appends `element` at the tail.
    ///
    /// # Panics
    ///
    /// Panics if `element` is the configured sentinel.
    pub fn offer(&mut self, element: u64) {
        assert!(
            self.null_value != Some(element),
            "attempted to store the queue's null value {element:#x}"
        );

        self.elements[self.tail] = element;
        self.tail = (self.tail + 1) & self.mask();

        if self.tail == self.head {
            self.increase_capacity();
        }
    }

    /// Appends `element` at the tail. Alias of [`ArrayQueue::offer`].
    ///
    /// # Panics
    ///
    /// Panics if `element` is the configured sentinel.
    #[inline]
    pub fn push(&mut self, element: u64) {
        self.offer(element);
    }

    /// Removes and returns the element at the head.
    pub fn poll(&mut self) -> Option<u64> {
        if self.is_empty() {
            return None;
        }

        let element = self.elements[self.head];
        self.elements[self.head] = self.fill_value();
        self.head = (self.head + 1) & self.mask();
        Some(element)
    }

    /// Removes and returns the element at the tail.
    pub fn pop(&mut self) -> Option<u64> {
        if self.is_empty() {
            return None;
        }

        self.tail = self.tail.wrapping_sub(1) & self.mask();
        let element = self.elements[self.tail];
        self.elements[self.tail] = self.fill_value();
        Some(element)
    }

    /// Returns the element at the head without removing it.
    pub fn peek(&self) -> Option<u64> {
        (!self.is_empty()).then(|| self.elements[self.head])
    }

    /// Returns the element at the tail without removing it.
    pub fn peek_back(&self) -> Option<u64> {
        (!self.is_empty()).then(|| self.elements[self.tail.wrapping_sub(1) & self.mask()])
    }

    /// Returns the `index`th element counted from the head.
    pub fn get(&self, index: usize) -> Option<u64> {
        (index < self.len()).then(|| self.elements[(self.head + index) & self.mask()])
    }

    /// Shortens the queue to `len` elements, dropping elements at the tail.
    pub fn truncate(&mut self, len: usize) {
        while self.len() > len {
            self.pop();
        }
    }

    /// Iterates from head to tail without consuming the queue.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            queue: self,
            index: self.head,
        }
    }

    #[inline]
    fn mask(&self) -> usize {
        self.elements.len() - 1
    }

    #[inline]
    fn fill_value(&self) -> u64 {
        self.null_value.unwrap_or(0)
    }

    fn increase_capacity(&mut self) {
        let old_head = self.head;
        let old_capacity = self.elements.len();
        let to_end_of_array = old_capacity - old_head;
        let new_capacity = old_capacity
            .checked_mul(2)
            .expect("array queue reached its maximum capacity");

        let mut elements = vec![self.fill_value(); new_capacity].into_boxed_slice();
        elements[..to_end_of_array].copy_from_slice(&self.elements[old_head..]);
        elements[to_end_of_array..old_capacity].copy_from_slice(&self.elements[..old_head]);

        self.elements = elements;
        self.head = 0;
        self.tail = old_capacity;
    }
}

impl fmt::Debug for ArrayQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl fmt::Display for ArrayQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, element) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{element}")?;
        }
        f.write_str("]")
    }
}

impl<'a> IntoIterator for &'a ArrayQueue {
    type Item = u64;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Head-to-tail iterator over an [`ArrayQueue`].
pub struct Iter<'a> {
    queue: &'a ArrayQueue,
    index: usize,
}

impl Iterator for Iter<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index == self.queue.tail {
            return None;
        }
        let element = self.queue.elements[self.index];
        self.index = (self.index + 1) & self.queue.mask();
        Some(element)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.queue.tail.wrapping_sub(self.index) & self.queue.mask();
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Iter<'_> {}

/// The interpreter's operand stack: a LIFO view over an [`ArrayQueue`] without a
/// sentinel, since every 64-bit pattern is a legal operand.
#[derive(Debug)]
pub struct OperandStack {
    queue: ArrayQueue,
}

impl Default for OperandStack {
    fn default() -> Self {
        Self::new()
    }
}

impl OperandStack {
    pub fn new() -> Self {
        Self {
            queue: ArrayQueue::with_capacity(MIN_CAPACITY, None),
        }
    }

    #[inline]
    pub fn push(&mut self, value: u64) {
        self.queue.push(value);
    }

    /// Pops the top operand.
    ///
    /// # Errors
    ///
    /// Underflow only happens for code that skipped validation; it is reported as
    /// [`Error::Invalid`].
    #[inline]
    pub fn pop(&mut self) -> crate::Result<u64> {
        self.queue
            .pop()
            .ok_or_else(|| Error::Invalid("operand stack underflow".into()))
    }

    pub fn peek(&self) -> Option<u64> {
        self.queue.peek_back()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn truncate(&mut self, len: usize) {
        self.queue.truncate(len);
    }

    /// Moves the top `keep` operands down so they sit directly on top of `height`,
    /// dropping everything in between.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Invalid`] if fewer than `height + keep` operands are present.
    pub fn unwind(&mut self, height: usize, keep: usize) -> crate::Result<()> {
        let len = self.len();
        if len < height + keep {
            return Err(Error::Invalid("operand stack underflow".into()));
        }
        if len == height + keep {
            return Ok(());
        }

        let mut kept = smallvec::SmallVec::<[u64; 4]>::with_capacity(keep);
        for _ in 0..keep {
            kept.push(self.pop()?);
        }
        self.truncate(height);
        for value in kept.into_iter().rev() {
            self.push(value);
        }
        Ok(())
    }

    /// Iterates from the bottom of the stack to the top.
    pub fn iter(&self) -> Iter<'_> {
        self.queue.iter()
    }
}
