//! Scatter-gather buffers shared between the caller and the session.
//!
//! The block layer owns the memory behind a request. A descriptor only keeps
//! a reference to it for as long as the request is in flight, so [`SgList`]
//! is a cheap handle: cloning it shares the same segments rather than copying
//! them.

use std::sync::{Arc, Mutex, PoisonError};

/// One contiguous piece of caller memory.
pub type Segment = Arc<Mutex<Vec<u8>>>;

#[derive(Debug, Clone, Default)]
pub struct SgList {
    segments: Vec<Segment>,
}

impl SgList {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single zero-filled segment of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        let mut list = Self::new();
        list.push(data);
        list
    }

    /// Appends a segment and returns the shared handle to it.
    pub fn push(&mut self, data: Vec<u8>) -> Segment {
        let segment = Arc::new(Mutex::new(data));
        self.segments.push(Arc::clone(&segment));
        segment
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Total size of all segments.
    pub fn len(&self) -> usize {
        self.segments
            .iter()
            .map(|segment| segment.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `data` across the segments in order.
    ///
    /// Stops at whichever runs out first and returns the number of bytes
    /// written.
    pub fn scatter(&self, data: &[u8]) -> usize {
        let mut written = 0;
        for segment in &self.segments {
            if written == data.len() {
                break;
            }
            let mut segment = segment.lock().unwrap_or_else(PoisonError::into_inner);
            let n = segment.len().min(data.len() - written);
            segment[..n].copy_from_slice(&data[written..written + n]);
            written += n;
        }
        written
    }

    /// Appends the contents of every segment to `out`.
    pub fn gather_into(&self, out: &mut Vec<u8>) {
        for segment in &self.segments {
            out.extend_from_slice(&segment.lock().unwrap_or_else(PoisonError::into_inner));
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        self.gather_into(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scatter_spans_segments() {
        let mut list = SgList::new();
        let first = list.push(vec![0; 3]);
        let second = list.push(vec![0; 4]);

        let written = list.scatter(&[1, 2, 3, 4, 5]);

        assert_eq!(written, 5);
        assert_eq!(*first.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(*second.lock().unwrap(), vec![4, 5, 0, 0]);
    }

    #[test]
    fn scatter_stops_when_buffer_is_full() {
        let list = SgList::zeroed(2);
        assert_eq!(list.scatter(&[9, 9, 9, 9]), 2);
        assert_eq!(list.to_vec(), vec![9, 9]);
    }

    #[test]
    fn clones_share_memory() {
        let list = SgList::zeroed(4);
        let caller_view = list.clone();
        list.scatter(&[7, 7]);
        assert_eq!(caller_view.to_vec(), vec![7, 7, 0, 0]);
        assert_eq!(caller_view.len(), 4);
    }
}
