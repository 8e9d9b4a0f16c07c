//! Firmware upload state machine.

use std::fmt;

use tracing::info;

/// Phase of a firmware upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadState {
    /// Nothing started.
    #[default]
    Idle,
    /// Identifying the bootloader and validating the device.
    Initializing,
    /// Device validated; program mode not yet entered.
    ReadyToProgram,
    Erasing,
    Writing,
    Verifying,
    /// Sending the exit command.
    Exiting,
    Done,
    Failed,
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadState::Idle => write!(f, "IDLE"),
            UploadState::Initializing => write!(f, "INITIALIZING"),
            UploadState::ReadyToProgram => write!(f, "READY_TO_PROGRAM"),
            UploadState::Erasing => write!(f, "ERASING"),
            UploadState::Writing => write!(f, "WRITING"),
            UploadState::Verifying => write!(f, "VERIFYING"),
            UploadState::Exiting => write!(f, "EXITING"),
            UploadState::Done => write!(f, "DONE"),
            UploadState::Failed => write!(f, "FAILED"),
        }
    }
}

impl UploadState {
    /// True once the upload can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Done | UploadState::Failed)
    }

    /// True while device memory may be modified.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            UploadState::Erasing | UploadState::Writing | UploadState::Verifying
        )
    }
}

/// Block progress within the current phase.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BlockProgress {
    pub current: usize,
    pub total: usize,
}

impl BlockProgress {
    pub fn new(total: usize) -> Self {
        Self { current: 0, total }
    }

    pub fn advance(&mut self) {
        self.current += 1;
    }

    /// Progress as percentage.
    pub fn progress_pct(&self) -> u8 {
        if self.total == 0 {
            100
        } else {
            ((self.current.min(self.total) * 100) / self.total) as u8
        }
    }
}

/// Runtime state of one upload.
#[derive(Debug, Default)]
pub struct UploadContext {
    pub state: UploadState,
    pub progress: BlockProgress,
}

impl UploadContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition to a new state, returning the previous one.
    pub fn goto_state(&mut self, new_state: UploadState) -> UploadState {
        info!(from = %self.state, to = %new_state, "State transition");
        std::mem::replace(&mut self.state, new_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_goto_state() {
        let mut ctx = UploadContext::new();
        assert_eq!(ctx.state, UploadState::Idle);
        assert_eq!(ctx.goto_state(UploadState::Initializing), UploadState::Idle);
        assert_eq!(ctx.state, UploadState::Initializing);
    }

    #[test]
    fn test_state_classes() {
        assert!(UploadState::Done.is_terminal());
        assert!(UploadState::Failed.is_terminal());
        assert!(!UploadState::Exiting.is_terminal());
        assert!(UploadState::Writing.is_destructive());
        assert!(!UploadState::Initializing.is_destructive());
    }

    #[test]
    fn test_block_progress() {
        let mut p = BlockProgress::new(4);
        assert_eq!(p.progress_pct(), 0);
        p.advance();
        assert_eq!(p.progress_pct(), 25);
        p.advance();
        p.advance();
        p.advance();
        assert_eq!(p.progress_pct(), 100);
        assert_eq!(BlockProgress::new(0).progress_pct(), 100);
    }
}
