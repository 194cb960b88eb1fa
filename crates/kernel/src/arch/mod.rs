//! Architecture glue. x86-64 only; the saved-frame layout and the
//! selector constants are ABI for the rest of the core.

mod x86_64;

pub use x86_64::*;
