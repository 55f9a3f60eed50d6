// Copyright 2020 Netwarps Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

use std::collections::VecDeque;

/// An ordered sequence of byte chunks awaiting consumption.
///
/// Data frame payloads are appended as whole chunks; the stream reader
/// consumes them in arbitrary smaller steps. Only the front chunk keeps a
/// consumption offset, all later chunks are still intact.
#[derive(Debug, Default)]
pub(crate) struct Chunks {
    seq: VecDeque<Vec<u8>>,
    offset: usize,
    len: usize,
}

impl Chunks {
    pub(crate) fn new() -> Self {
        Chunks::default()
    }

    /// The total number of unconsumed bytes.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a chunk of bytes to the end.
    pub(crate) fn push(&mut self, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            self.len += bytes.len();
            self.seq.push_back(bytes)
        }
    }

    /// Move as many bytes as available into `buf`, front to back.
    ///
    /// Returns the number of bytes copied; 0 only if no data is buffered
    /// or `buf` is empty.
    pub(crate) fn read_into(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            let front_len = match self.seq.front() {
                Some(front) => {
                    let k = std::cmp::min(front.len() - self.offset, buf.len() - n);
                    buf[n..n + k].copy_from_slice(&front[self.offset..self.offset + k]);
                    n += k;
                    self.offset += k;
                    front.len()
                }
                None => break,
            };
            if self.offset == front_len {
                self.seq.pop_front();
                self.offset = 0
            }
        }
        self.len -= n;
        n
    }

    /// Drop all buffered data.
    pub(crate) fn clear(&mut self) {
        self.seq.clear();
        self.offset = 0;
        self.len = 0
    }
}

#[cfg(test)]
mod tests {
    use super::Chunks;

    #[test]
    fn empty() {
        let mut c = Chunks::new();
        assert!(c.is_empty());
        assert_eq!(0, c.len());
        let mut buf = [0u8; 8];
        assert_eq!(0, c.read_into(&mut buf))
    }

    #[test]
    fn push_ignores_empty_chunks() {
        let mut c = Chunks::new();
        c.push(Vec::new());
        assert!(c.is_empty())
    }

    #[test]
    fn partial_reads_span_chunks() {
        let mut c = Chunks::new();
        c.push(vec![1, 2, 3]);
        c.push(vec![4, 5]);
        assert_eq!(5, c.len());

        let mut buf = [0u8; 2];
        assert_eq!(2, c.read_into(&mut buf));
        assert_eq!([1, 2], buf);
        assert_eq!(3, c.len());

        let mut buf = [0u8; 4];
        assert_eq!(3, c.read_into(&mut buf));
        assert_eq!([3, 4, 5], buf[..3]);
        assert!(c.is_empty())
    }

    #[test]
    fn clear_discards_everything() {
        let mut c = Chunks::new();
        c.push(vec![1, 2, 3]);
        c.clear();
        assert!(c.is_empty());
        let mut buf = [0u8; 4];
        assert_eq!(0, c.read_into(&mut buf))
    }
}
