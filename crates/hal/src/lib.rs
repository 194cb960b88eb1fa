//! Hardware abstraction for the VesperOS core.
//!
//! The kernel crate sees four seams: interrupt flag control
//! ([`interrupts`]), interrupt-safe locking ([`sync`]), the local
//! APIC ([`apic`]) and physical frame allocation ([`memory`]).
//! Every seam has a host build (`std` feature) so the scheduler and
//! lifecycle logic can be exercised with `cargo test` on the dev
//! machine; the real register-level paths only compile for bare
//! metal x86-64.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod apic;
pub mod interrupts;
pub mod memory;
pub mod sync;

#[cfg(all(target_arch = "x86_64", not(feature = "std")))]
pub mod x86_64;

#[cfg(all(target_arch = "x86_64", not(feature = "std")))]
mod logger;
#[cfg(all(target_arch = "x86_64", not(feature = "std")))]
pub use logger::init_logging;

pub use sync::IrqSafeLock;
