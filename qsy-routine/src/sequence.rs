//! Step sequence numbers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

/// Largest sequence number before wrapping back to 1.
pub const MAX_STEP_SEQUENCE: u16 = 32_767;

/// Shared source of step sequence numbers.
///
/// Every step entered by any executor draws a number from the same counter,
/// and every command and touche of that step carries it, so a late packet
/// from an earlier step (or an earlier executor) never matches the active
/// one. Numbers run `1..=32767` and then wrap to 1; 0 is never handed out
/// and marks commands outside any step.
///
/// Clones share the counter.
#[derive(Debug, Clone)]
pub struct StepCounter {
    next: Arc<AtomicU16>,
}

impl StepCounter {
    /// Counter whose first number is 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Counter whose first number is `first` (clamped into `1..=32767`).
    pub fn starting_at(first: u16) -> Self {
        Self {
            next: Arc::new(AtomicU16::new(first.clamp(1, MAX_STEP_SEQUENCE))),
        }
    }

    /// Take the next sequence number.
    pub fn next(&self) -> u16 {
        let advance = |current: u16| {
            Some(if current >= MAX_STEP_SEQUENCE {
                1
            } else {
                current + 1
            })
        };
        match self
            .next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, advance)
        {
            Ok(previous) | Err(previous) => previous,
        }
    }
}

impl Default for StepCounter {
    fn default() -> Self {
        Self::new()
    }
}
