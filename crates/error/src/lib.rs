//! Kernel error infrastructure.
//!
//! Every fallible subsystem declares its error enum through
//! [`define_kernel_error!`], which stamps the variants with a
//! `(subsystem, code)` pair so a logged failure can be traced back to
//! its origin without symbols.
//!
//! ```ignore
//! define_kernel_error! {
//!     pub enum ElfLoadError(0x02) {
//!         TruncatedImage = 0x01 => "ELF image truncated",
//!         BadMagic = 0x02 => "bad ELF magic",
//!     }
//! }
//! ```
//!
//! Variants may wrap an inner error, which `Display` chains:
//!
//! ```ignore
//! define_kernel_error! {
//!     pub enum ExecError(0x03) {
//!         Load(ElfLoadError) = 0x01 => "program load failed",
//!     }
//! }
//! ```

#![no_std]

/// Declares a kernel error enum.
///
/// The subsystem byte occupies the high half of [`code()`]; the
/// per-variant byte the low half. Generated impls: `code()`,
/// `label()`, `Display`, `core::error::Error`.
#[macro_export]
macro_rules! define_kernel_error {
    (
        $(#[$outer:meta])*
        $vis:vis enum $name:ident($subsystem:literal) {
            $(
                $(#[$inner_meta:meta])*
                $variant:ident $(($payload:ty))? = $code:literal => $label:literal
            ),* $(,)?
        }
    ) => {
        $(#[$outer])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $(
                $(#[$inner_meta])*
                $variant $(($payload))?,
            )*
        }

        impl $name {
            /// Subsystem byte shared by every variant of this enum.
            pub const SUBSYSTEM: u8 = $subsystem;

            /// `(subsystem << 8) | variant` code, stable for logs.
            pub const fn code(&self) -> u16 {
                match self {
                    $(
                        $crate::__error_pattern!($variant $(($payload))?) => {
                            (($subsystem as u16) << 8) | $code
                        }
                    )*
                }
            }

            /// Short human label for the variant.
            pub const fn label(&self) -> &'static str {
                match self {
                    $(
                        $crate::__error_pattern!($variant $(($payload))?) => $label,
                    )*
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "[E{:04x}] {}", self.code(), self.label())?;
                match self {
                    $(
                        $crate::__error_chain!($variant $(($payload))?) => {
                            $crate::__error_chain_write!(f, self, $variant $(($payload))?)
                        }
                    )*
                }
            }
        }

        impl core::error::Error for $name {}
    };
}

/// Internal: match pattern with the payload ignored.
#[doc(hidden)]
#[macro_export]
macro_rules! __error_pattern {
    ($variant:ident ($payload:ty)) => {
        Self::$variant(_)
    };
    ($variant:ident) => {
        Self::$variant
    };
}

/// Internal: match pattern used by the Display chain arm.
#[doc(hidden)]
#[macro_export]
macro_rules! __error_chain {
    ($variant:ident ($payload:ty)) => {
        Self::$variant(_)
    };
    ($variant:ident) => {
        Self::$variant
    };
}

/// Internal: append `: <inner>` for payload-carrying variants.
#[doc(hidden)]
#[macro_export]
macro_rules! __error_chain_write {
    ($f:ident, $self:ident, $variant:ident ($payload:ty)) => {
        if let Self::$variant(inner) = $self {
            write!($f, ": {}", inner)
        } else {
            Ok(())
        }
    };
    ($f:ident, $self:ident, $variant:ident) => {
        Ok(())
    };
}
