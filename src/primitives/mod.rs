//! Low-level primitives shared by the storage engine and the event queue.

/// File I/O helpers.
///
/// Atomic whole-file replacement and tolerant reads/removals used for page files
/// and persisted state.
pub mod io;
