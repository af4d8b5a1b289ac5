/*
 * Copyright (C) 2025 Filament Contributors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

// fixed-capacity contiguous read buffer. bytes are appended at the end and
// consumed from the front; consumed space is reclaimed by shifting the
// remaining bytes when more room is needed

pub struct ReadBuffer {
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl ReadBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            start: 0,
            end: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity() - self.len()
    }

    pub fn read_buf(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    pub fn read_commit(&mut self, size: usize) {
        assert!(size <= self.len());

        self.start += size;

        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    pub fn write_buf(&mut self) -> &mut [u8] {
        if self.end == self.buf.len() && self.start > 0 {
            self.align();
        }

        &mut self.buf[self.end..]
    }

    pub fn write_commit(&mut self, size: usize) {
        assert!(self.end + size <= self.buf.len());

        self.end += size;
    }

    fn align(&mut self) {
        self.buf.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write() {
        let mut buf = ReadBuffer::new(8);

        assert_eq!(buf.len(), 0);
        assert_eq!(buf.is_empty(), true);
        assert_eq!(buf.remaining_capacity(), 8);

        buf.write_buf()[..5].copy_from_slice(b"hello");
        buf.write_commit(5);

        assert_eq!(buf.read_buf(), b"hello");
        assert_eq!(buf.remaining_capacity(), 3);

        buf.read_commit(2);
        assert_eq!(buf.read_buf(), b"llo");

        // consuming everything resets the window
        buf.read_commit(3);
        assert_eq!(buf.is_empty(), true);
        assert_eq!(buf.remaining_capacity(), 8);
    }

    #[test]
    fn align_on_full() {
        let mut buf = ReadBuffer::new(4);

        buf.write_buf()[..4].copy_from_slice(b"abcd");
        buf.write_commit(4);

        buf.read_commit(2);
        assert_eq!(buf.read_buf(), b"cd");

        // the end of the backing storage is reached, so writable space is
        // made by shifting the remaining bytes to the front
        let w = buf.write_buf();
        assert_eq!(w.len(), 2);
        w.copy_from_slice(b"ef");
        buf.write_commit(2);

        assert_eq!(buf.read_buf(), b"cdef");
    }
}
