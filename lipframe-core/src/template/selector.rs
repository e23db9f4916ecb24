//! Ping-pong traversal over a short template clip.
//!
//! For a clip of `len` frames the emitted indices bounce between `0` and
//! `len - 1`: `0, 1, …, len-1, len-2, …, 1, 0, 1, …` (period `2·(len-1)`).
//! The stateful form mirrors a frame-by-frame renderer; [`index_at`] gives
//! the same value for any step directly, so parallel workers never share a
//! counter.
//!
//! [`index_at`]: TemplateIndexSelector::index_at

use crate::error::{LipframeError, Result};

#[derive(Debug, Clone)]
pub struct TemplateIndexSelector {
    len: usize,
    offset: usize,
    idx: usize,
    stride: isize,
}

impl TemplateIndexSelector {
    pub fn new(len: usize) -> Result<Self> {
        Self::with_offset(len, 0)
    }

    /// Bounce over `offset .. offset + len` instead of `0 .. len`.
    pub fn with_offset(len: usize, offset: usize) -> Result<Self> {
        if len == 0 {
            return Err(LipframeError::InvalidConfig(
                "template clip has no frames".into(),
            ));
        }
        Ok(Self {
            len,
            offset,
            idx: 0,
            stride: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Emit the current index, then advance.
    pub fn next_index(&mut self) -> usize {
        let current = self.offset + self.idx;
        if self.len > 1 {
            if self.idx > self.len - 2 {
                self.stride = -1;
            }
            if self.idx < 1 {
                self.stride = 1;
            }
            self.idx = self.idx.saturating_add_signed(self.stride);
        }
        current
    }

    /// Index emitted at output step `step` (0-based), without state.
    pub fn index_at(&self, step: usize) -> usize {
        if self.len == 1 {
            return self.offset;
        }
        let period = 2 * (self.len - 1);
        let r = step % period;
        let bounced = if r < self.len { r } else { period - r };
        self.offset + bounced
    }

    pub fn reset(&mut self) {
        self.idx = 0;
        self.stride = 0;
    }
}

impl Iterator for TemplateIndexSelector {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        Some(self.next_index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_frame_clip_bounces() {
        let seq: Vec<usize> = TemplateIndexSelector::new(5).unwrap().take(10).collect();
        assert_eq!(seq, vec![0, 1, 2, 3, 4, 3, 2, 1, 0, 1]);
    }

    #[test]
    fn closed_form_matches_stateful_sequence() {
        for len in 1..9 {
            let sel = TemplateIndexSelector::new(len).unwrap();
            let stateful: Vec<usize> = sel.clone().take(100).collect();
            let closed: Vec<usize> = (0..100).map(|s| sel.index_at(s)).collect();
            assert_eq!(stateful, closed, "len={len}");
            assert!(stateful.iter().all(|&i| i < len));
        }
    }

    #[test]
    fn degenerate_lengths() {
        let mut one = TemplateIndexSelector::new(1).unwrap();
        assert!((0..5).all(|_| one.next_index() == 0));
        let two: Vec<usize> = TemplateIndexSelector::new(2).unwrap().take(5).collect();
        assert_eq!(two, vec![0, 1, 0, 1, 0]);
        assert!(TemplateIndexSelector::new(0).is_err());
    }

    #[test]
    fn offset_shifts_every_index() {
        let sel = TemplateIndexSelector::with_offset(3, 10).unwrap();
        let seq: Vec<usize> = sel.clone().take(5).collect();
        assert_eq!(seq, vec![10, 11, 12, 11, 10]);
        assert_eq!(sel.index_at(4), 10);
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut sel = TemplateIndexSelector::new(4).unwrap();
        for _ in 0..5 {
            sel.next_index();
        }
        sel.reset();
        assert_eq!(sel.next_index(), 0);
        assert_eq!(sel.next_index(), 1);
    }
}
