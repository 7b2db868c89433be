//! Runtime properties: thread-count defaults.

use std::env;

use tandem_core::ScheduleError;

/// Environment variable overriding the default team size.
pub const THREADS_ENV: &str = "TANDEM_THREADS";

/// Requested size of a thread team.
///
/// The default is one thread per core of the machine, overridable through the
/// `TANDEM_THREADS` environment variable; an explicit
/// [`threads(n)`](crate::ParallelFor::threads) call on the parallel statement
/// wins over both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadCount {
    /// One thread per core (or the `TANDEM_THREADS` override).
    Cores,
    /// Exactly this many threads.
    Fixed(usize),
}

impl Default for ThreadCount {
    fn default() -> Self {
        ThreadCount::Cores
    }
}

impl ThreadCount {
    /// Resolves to a concrete team size, rejecting zero.
    pub fn resolve(self) -> Result<usize, ScheduleError> {
        match self {
            ThreadCount::Fixed(0) => Err(ScheduleError::InvalidThreads(0)),
            ThreadCount::Fixed(threads) => Ok(threads),
            ThreadCount::Cores => Ok(default_threads()),
        }
    }
}

/// The machine-wide default team size: the `TANDEM_THREADS` environment
/// variable if set to a positive integer, otherwise the number of cores.
pub fn default_threads() -> usize {
    env::var(THREADS_ENV)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|&threads| threads >= 1)
        .unwrap_or_else(num_cpus::get)
}
