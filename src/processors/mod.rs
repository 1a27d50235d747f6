//! Image processing stages: filtering, spot finding and decoding.

pub mod decoding;
pub mod filtering;
pub mod spots;

pub use decoding::{
    decode, decode_and_filter, filter_by_intensity, per_round_max_code, DecodedResult, DecodedSpot,
};
pub use filtering::{apply_step, FilterChain, FilterError};
pub use spots::{find_spots, InvalidParameterError, Spot, SpotFinderError, SpotTable};

use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};

/// Run `op` on a dedicated pool of `n_threads` workers, or on the global
/// rayon pool when `None`.
pub(crate) fn with_workers<R, F>(n_threads: Option<usize>, op: F) -> Result<R, ThreadPoolBuildError>
where
    R: Send,
    F: FnOnce() -> R + Send,
{
    match build_pool(n_threads)? {
        Some(pool) => Ok(pool.install(op)),
        None => Ok(op()),
    }
}

pub(crate) fn build_pool(n_threads: Option<usize>) -> Result<Option<ThreadPool>, ThreadPoolBuildError> {
    n_threads
        .map(|n| ThreadPoolBuilder::new().num_threads(n).build())
        .transpose()
}

/// Log level for per-chunk progress messages.
#[inline]
pub(crate) fn progress_level(verbose: bool) -> log::Level {
    if verbose {
        log::Level::Info
    } else {
        log::Level::Debug
    }
}
