use super::Frame;

// The hand survives across calls; the two-sweep bound relies on it.
pub struct ClockReplacer {
    cursor: usize,
}

impl ClockReplacer {
    pub fn new() -> Self {
        Self { cursor: 0 }
    }

    pub fn pick_victim(&mut self, frames: &mut [Frame]) -> Option<usize> {
        for _ in 0..frames.len() * 2 {
            let frame = &mut frames[self.cursor];
            if !frame.valid {
                return Some(self.cursor);
            }
            if !frame.is_pinned() {
                if frame.referenced {
                    frame.referenced = false;
                } else {
                    return Some(self.cursor);
                }
            }
            self.cursor = (self.cursor + 1) % frames.len();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PageId;

    fn valid_frame(page_id: PageId, pin_count: u32, referenced: bool) -> Frame {
        let mut frame = Frame::new();
        frame.page_id = page_id;
        frame.pin_count = pin_count;
        frame.referenced = referenced;
        frame.valid = true;
        frame
    }

    #[test]
    fn test_invalid_frame_is_taken_in_place() {
        let mut frames = vec![
            valid_frame(PageId(1), 0, true),
            Frame::new(),
            Frame::new(),
        ];
        let mut replacer = ClockReplacer::new();

        // frame 0 gets its second chance, frame 1 is invalid and taken as is
        assert_eq!(replacer.pick_victim(&mut frames), Some(1));
        // the cursor did not move past the invalid frame
        assert_eq!(replacer.pick_victim(&mut frames), Some(1));
    }

    #[test]
    fn test_second_chance_sweep() {
        let mut frames = vec![
            valid_frame(PageId(1), 1, true),
            valid_frame(PageId(2), 0, true),
            valid_frame(PageId(3), 0, true),
        ];
        let mut replacer = ClockReplacer::new();

        assert_eq!(replacer.pick_victim(&mut frames), Some(1));
        assert!(!frames[2].referenced);

        // a re-referenced frame is passed over in favor of the next candidate
        frames[1].referenced = true;
        assert_eq!(replacer.pick_victim(&mut frames), Some(2));
    }

    #[test]
    fn test_all_pinned() {
        let mut frames = vec![
            valid_frame(PageId(1), 1, false),
            valid_frame(PageId(2), 2, true),
        ];
        let mut replacer = ClockReplacer::new();

        assert_eq!(replacer.pick_victim(&mut frames), None);
        assert_eq!(replacer.pick_victim(&mut frames), None);
    }
}
