// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::iter::Iterator;

use super::Array;

/// An iterator over the elements of an [`Array`].
pub struct ArrayIter<'a, A: Array> {
    data: &'a A,
    pos: usize,
}

impl<'a, A: Array> Clone for ArrayIter<'a, A> {
    fn clone(&self) -> Self {
        Self {
            data: self.data,
            pos: self.pos,
        }
    }
}

impl<'a, A: Array> ArrayIter<'a, A> {
    pub fn new(data: &'a A) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a, A: Array> Iterator for ArrayIter<'a, A> {
    type Item = Option<&'a A::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            None
        } else {
            let item = self.data.get(self.pos);
            self.pos += 1;
            Some(item)
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let exact = self.data.len() - self.pos;
        (exact, Some(exact))
    }
}

impl<'a, A: Array> ExactSizeIterator for ArrayIter<'a, A> {}
