//! Terminators for interrupting long-running optimizations.
//!
//! Convergence itself is decided inside the interior-point loop (see
//! [`crate::ipm::barrier`]); terminators cover the external reasons to stop:
//! wall-clock limits, Ctrl-C, or a caller-defined condition.
//!
//! # Note
//! [`InterruptTerminator`] installs a global signal handler and **can only be
//! constructed once** per process. Attempting to create multiple instances
//! will result in a panic.

use std::sync::{atomic::AtomicBool, Arc};

use crate::{callback::ProgressInfo, SolverOptions, Status};

/// Criterion for deciding when the solver should stop early.
///
/// Checked once per major iteration. Returns `Some(Status)` to stop, or
/// `None` to continue.
pub trait Terminator {
    /// Creates a new terminator from solver options.
    fn new(options: &SolverOptions) -> Self
    where
        Self: Sized;

    /// Called once before the first iteration to reset any internal state
    /// (e.g. timers).
    fn initialize(&mut self) {}

    /// Returns `Some(status)` if the solver should stop, `None` otherwise.
    fn terminate(&mut self, info: &ProgressInfo) -> Option<Status>;
}

/// A terminator that never triggers. The solver runs until convergence or
/// the iteration limit.
pub struct NullTerminator {}

impl Terminator for NullTerminator {
    fn new(_options: &SolverOptions) -> Self {
        Self {}
    }

    fn terminate(&mut self, _info: &ProgressInfo) -> Option<Status> {
        None
    }
}

/// Terminator that responds to Ctrl-C (SIGINT) or programmatic interrupts.
pub struct InterruptTerminator {
    interrupted: Arc<AtomicBool>,
}

impl InterruptTerminator {
    pub fn interrupt(&mut self) {
        self.interrupted
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Terminator for InterruptTerminator {
    fn new(_options: &SolverOptions) -> Self {
        let interrupted = Arc::new(AtomicBool::new(false));
        ctrlc::set_handler({
            let interrupted_clone = interrupted.clone();
            move || {
                interrupted_clone.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        })
        .expect("Error setting Ctrl-C handler");
        Self { interrupted }
    }

    fn terminate(&mut self, _info: &ProgressInfo) -> Option<Status> {
        if self.interrupted.load(std::sync::atomic::Ordering::SeqCst) {
            Some(Status::Interrupted)
        } else {
            None
        }
    }
}

/// Terminator that triggers after `max_time` seconds.
pub struct TimeOutTerminator {
    start_time: std::time::Instant,
    max_time: u64,
}

impl Terminator for TimeOutTerminator {
    fn new(options: &SolverOptions) -> Self {
        Self {
            start_time: std::time::Instant::now(),
            max_time: options.get_option::<u64>("max_time").unwrap_or(3600),
        }
    }

    fn initialize(&mut self) {
        self.start_time = std::time::Instant::now();
    }

    fn terminate(&mut self, _info: &ProgressInfo) -> Option<Status> {
        if self.start_time.elapsed().as_secs() >= self.max_time {
            Some(Status::TimeLimit)
        } else {
            None
        }
    }
}

/// Combines multiple terminators; stops on the first one that fires.
pub struct MultiTerminator {
    terminators: Vec<Box<dyn Terminator>>,
}

impl MultiTerminator {
    pub fn new_with_terminators(terminators: Vec<Box<dyn Terminator>>) -> Self {
        Self { terminators }
    }

    pub fn add_terminator(&mut self, terminator: Box<dyn Terminator>) {
        self.terminators.push(terminator);
    }
}

impl Terminator for MultiTerminator {
    fn new(options: &SolverOptions) -> Self {
        Self {
            terminators: vec![
                Box::new(InterruptTerminator::new(options)),
                Box::new(TimeOutTerminator::new(options)),
            ],
        }
    }

    fn initialize(&mut self) {
        for terminator in &mut self.terminators {
            terminator.initialize();
        }
    }

    fn terminate(&mut self, info: &ProgressInfo) -> Option<Status> {
        for terminator in &mut self.terminators {
            if let Some(status) = terminator.terminate(info) {
                return Some(status);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_terminator() {
        let mut options = SolverOptions::new();
        options.set_option("max_time", 0u64).unwrap();

        let mut terminator = TimeOutTerminator::new(&options);
        terminator.initialize();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(
            terminator.terminate(&ProgressInfo::default()),
            Some(Status::TimeLimit)
        );
    }

    #[test]
    fn test_null_terminator() {
        let mut terminator = NullTerminator::new(&SolverOptions::new());
        assert_eq!(terminator.terminate(&ProgressInfo::default()), None);
    }
}
