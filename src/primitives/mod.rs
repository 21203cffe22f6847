//! Low-level primitives shared by the cache and its workers.

/// Concurrency primitives and synchronization.
///
/// Readiness barrier and cancellation flag used by population workers.
pub mod concurrency;
