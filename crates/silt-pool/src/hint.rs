//! Scheduling hint seam.
//!
//! Platform thread-priority manipulation stays outside the core: the
//! pool only depends on "reduce/increase active worker count" plus this
//! narrow hint interface, which platforms without controllable thread
//! priority implement as a no-op.

/// Receiver for CPU-pressure scheduling hints.
pub trait SchedulingHint: Send + Sync {
    /// The process is under CPU pressure; deprioritize pool threads if
    /// the platform allows it.
    fn throttle(&self) {}

    /// CPU pressure subsided; restore normal scheduling.
    fn restore(&self) {}
}

/// Hint implementation that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSchedulingHint;

impl SchedulingHint for NoopSchedulingHint {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_hint_is_callable() {
        let hint = NoopSchedulingHint;
        hint.throttle();
        hint.restore();
    }
}
