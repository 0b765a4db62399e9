use std::time::Instant;

use anyhow::{Error, Result};

/// Byte sink that muxer output is flushed into.
///
/// The first append reserves the configured prealloc; after that the
/// capacity doubles until the write fits, so segment growth never degrades
/// into per-write reallocation.
pub struct SegmentBuffer {
    data: Vec<u8>,
    prealloc: usize,
}

impl SegmentBuffer {
    pub fn new(prealloc: usize) -> Self {
        Self {
            data: Vec::new(),
            prealloc,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let need = self.data.len() + bytes.len();
        if need > self.data.capacity() {
            let mut cap = if self.data.capacity() == 0 {
                self.prealloc.max(1)
            } else {
                self.data.capacity()
            };
            while cap < need {
                cap <<= 1;
            }
            self.data
                .try_reserve_exact(cap - self.data.len())
                .map_err(|_| Error::msg("segment buffer allocation failed"))?;
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

/// One finalized or in-progress segment in the ring.
pub struct Segment {
    pub number: u64,
    pub ready: bool,
    pub buf: Box<SegmentBuffer>,
    pub opened_at: Instant,
}

/// Fixed-capacity ring of segments with monotonic numbering.
///
/// Slot index is `number % capacity`; at most one slot (the active one) is
/// not ready. Ready segment numbers form a contiguous window ending at
/// `head - 1`.
pub struct SegmentRing {
    slots: Vec<Option<Segment>>,
    head: u64,
    active: Option<usize>,
    prealloc: usize,
}

impl SegmentRing {
    pub fn new(capacity: usize, prealloc: usize) -> Self {
        let capacity = capacity.max(4);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            active: None,
            prealloc,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Allocate the next segment, reclaiming whatever previously occupied
    /// its slot. The caller must have closed the previous active segment.
    pub fn open_next(&mut self) -> &mut Segment {
        let idx = (self.head % self.slots.len() as u64) as usize;
        self.slots[idx] = Some(Segment {
            number: self.head,
            ready: false,
            buf: Box::new(SegmentBuffer::new(self.prealloc)),
            opened_at: Instant::now(),
        });
        self.active = Some(idx);
        self.head += 1;
        self.slots[idx].as_mut().unwrap()
    }

    pub fn active_number(&self) -> Option<u64> {
        self.active
            .and_then(|i| self.slots[i].as_ref())
            .map(|s| s.number)
    }

    /// Mark the active segment ready. An empty segment is dropped instead;
    /// nothing useful can be served from it.
    pub fn finalize_active(&mut self) -> Option<u64> {
        let idx = self.active.take()?;
        let seg = self.slots[idx].as_mut()?;
        if seg.buf.is_empty() {
            self.slots[idx] = None;
            return None;
        }
        seg.ready = true;
        Some(seg.number)
    }

    /// Drop the active segment without publishing it.
    pub fn abandon_active(&mut self) {
        if let Some(idx) = self.active.take() {
            self.slots[idx] = None;
        }
    }

    /// Ready segment with exactly this number, if it is still in the ring.
    pub fn get(&self, number: u64) -> Option<&Segment> {
        let idx = (number % self.slots.len() as u64) as usize;
        self.slots[idx]
            .as_ref()
            .filter(|s| s.ready && s.number == number)
    }

    /// Contiguous window of ready segments ending at the newest one,
    /// oldest first. A stale or missing slot cuts off everything older
    /// than it, so the window can never expose a gap.
    pub fn ready_window(&self) -> Vec<&Segment> {
        let mut window = Vec::new();
        let mut n = self.head;
        while n > 0 && window.len() < self.slots.len() {
            n -= 1;
            let idx = (n % self.slots.len() as u64) as usize;
            match self.slots[idx].as_ref() {
                Some(seg) if seg.number == n && seg.ready => window.push(seg),
                // the newest slot may be the still-open active segment
                Some(seg) if seg.number == n && !seg.ready && window.is_empty() => continue,
                _ => break,
            }
        }
        window.reverse();
        window
    }

    #[cfg(test)]
    pub fn push_ready(&mut self, bytes: &[u8]) -> u64 {
        let seg = self.open_next();
        seg.buf.append(bytes).unwrap();
        let num = seg.number;
        self.finalize_active();
        num
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_grows_by_doubling_from_prealloc() {
        let mut buf = SegmentBuffer::new(1024);
        buf.append(&[0u8; 10]).unwrap();
        assert!(buf.capacity_for_tests() >= 1024);
        buf.append(&vec![0u8; 1500]).unwrap();
        assert!(buf.capacity_for_tests() >= 2048);
        assert_eq!(buf.len(), 1510);
    }

    #[test]
    fn segment_numbers_are_monotonic() {
        let mut ring = SegmentRing::new(4, 64);
        let mut last = None;
        for _ in 0..10 {
            let n = ring.push_ready(b"x");
            if let Some(prev) = last {
                assert_eq!(n, prev + 1);
            }
            last = Some(n);
        }
        assert_eq!(ring.head, 10);
    }

    #[test]
    fn ring_wrap_reclaims_oldest() {
        let mut ring = SegmentRing::new(4, 64);
        for _ in 0..4 {
            ring.push_ready(b"seg");
        }
        assert!(ring.get(0).is_some());
        ring.push_ready(b"seg");
        assert_eq!(ring.head, 5);
        // segment 4 overwrote slot 0
        assert!(ring.get(0).is_none());
        assert!(ring.get(4).is_some());
        let window = ring.ready_window();
        let nums: Vec<u64> = window.iter().map(|s| s.number).collect();
        assert_eq!(nums, vec![1, 2, 3, 4]);
    }

    #[test]
    fn window_skips_open_active_segment() {
        let mut ring = SegmentRing::new(4, 64);
        ring.push_ready(b"a");
        ring.push_ready(b"b");
        ring.open_next();
        let nums: Vec<u64> = ring.ready_window().iter().map(|s| s.number).collect();
        assert_eq!(nums, vec![0, 1]);
    }

    #[test]
    fn abandoned_segment_is_not_served() {
        let mut ring = SegmentRing::new(4, 64);
        ring.push_ready(b"a");
        {
            let seg = ring.open_next();
            seg.buf.append(b"junk").unwrap();
        }
        ring.abandon_active();
        assert!(ring.get(1).is_none());
        let nums: Vec<u64> = ring.ready_window().iter().map(|s| s.number).collect();
        assert_eq!(nums, vec![0]);
    }

    #[test]
    fn empty_segment_is_dropped_on_finalize() {
        let mut ring = SegmentRing::new(4, 64);
        ring.open_next();
        assert_eq!(ring.finalize_active(), None);
        assert!(ring.ready_window().is_empty());
    }

    #[test]
    fn get_requires_exact_number_match() {
        let mut ring = SegmentRing::new(4, 64);
        for _ in 0..6 {
            ring.push_ready(b"x");
        }
        // slot of number 1 now holds number 5
        assert!(ring.get(1).is_none());
        assert!(ring.get(5).is_some());
    }

    impl SegmentBuffer {
        fn capacity_for_tests(&self) -> usize {
            self.data.capacity()
        }
    }
}
