//! Decides, call by call, whether the session is before, inside or after the subcapture.

use crate::config::InclusiveRange;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeState {
    BeforeRange,
    InRange,
    AfterRange,
}

/// Frame and execution counters against the configured range.
///
/// Frames are numbered from 1. The execution counter names the *next* `ExecuteCommandLists`
/// call of the current frame, also from 1, and restarts every frame. An execution sub-range
/// narrows the first frame from the left and the last frame from the right.
#[derive(Clone, Debug)]
pub struct SubcaptureRange {
    frames: InclusiveRange,
    executions: Option<InclusiveRange>,
    frame: u32,
    execution: u32,
}

impl SubcaptureRange {
    pub fn new(frames: InclusiveRange, executions: Option<InclusiveRange>) -> Self {
        Self {
            frames,
            executions,
            frame: 1,
            execution: 1,
        }
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn execution(&self) -> u32 {
        self.execution
    }

    pub fn state(&self) -> RangeState {
        if self.frame < self.frames.start {
            return RangeState::BeforeRange;
        }
        if self.frame > self.frames.end {
            return RangeState::AfterRange;
        }
        if let Some(executions) = self.executions {
            if self.frame == self.frames.start && self.execution < executions.start {
                return RangeState::BeforeRange;
            }
            if self.frame == self.frames.end && self.execution > executions.end {
                return RangeState::AfterRange;
            }
        }
        RangeState::InRange
    }

    pub fn in_range(&self) -> bool {
        self.state() == RangeState::InRange
    }

    /// The first frame of the range has begun and no execution sub-range narrows it.
    pub fn is_frame_range_start(&self) -> bool {
        self.executions.is_none() && self.frame == self.frames.start && self.execution == 1
    }

    /// The first execution of the configured execution sub-range is next.
    pub fn is_execution_range_start(&self) -> bool {
        self.executions.is_some_and(|executions| {
            self.frame == self.frames.start && self.execution == executions.start
        })
    }

    pub fn frame_end(&mut self) {
        self.frame += 1;
        self.execution = 1;
    }

    pub fn execution_end(&mut self) {
        self.execution += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_range_walks_through_all_states() {
        let mut range = SubcaptureRange::new(InclusiveRange::new(2, 3).unwrap(), None);
        assert_eq!(range.state(), RangeState::BeforeRange);
        assert!(!range.is_frame_range_start());

        range.frame_end();
        assert!(range.is_frame_range_start());
        assert!(range.in_range());
        range.execution_end();
        assert!(!range.is_frame_range_start());

        range.frame_end();
        assert!(range.in_range());
        range.frame_end();
        assert_eq!(range.state(), RangeState::AfterRange);
    }

    #[test]
    fn execution_range_narrows_first_and_last_frame() {
        let mut range = SubcaptureRange::new(
            InclusiveRange::single(1),
            Some(InclusiveRange::new(2, 3).unwrap()),
        );
        assert_eq!(range.state(), RangeState::BeforeRange);
        range.execution_end();
        assert!(range.is_execution_range_start());
        assert!(range.in_range());
        range.execution_end();
        assert!(range.in_range());
        assert!(!range.is_execution_range_start());
        range.execution_end();
        assert_eq!(range.state(), RangeState::AfterRange);
    }
}
