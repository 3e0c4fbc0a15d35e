//! Sandbox execution kernel.
//!
//! Each submission gets a fresh V8 isolate (via `deno_core`) with an 8 MiB
//! heap, a wall clock of `vmTimeout + 1000` ms, and the capability bridge
//! installed before any untrusted code runs. Guest faults never escape:
//! they come back as 🚫-prefixed strings, not errors.

pub mod kernel;
pub mod ops;
pub mod util;

pub use kernel::Kernel;
