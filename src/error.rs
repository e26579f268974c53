use alloc::{borrow::Cow, string::String};
use core::fmt::{Debug, Display};

/// Error types used throughout the `so_loader` library.
///
/// Every stage of the load pipeline reports failures through this type. None of
/// the operations retry: a failed step leaves the image as it was before the
/// call.
#[derive(Debug)]
pub enum Error {
    /// The container is not an ELF image this host can load.
    ///
    /// Covers bad magic, wrong class/endianness/machine, non-PIE images,
    /// truncated headers and tables that point outside the image.
    Format {
        /// A descriptive message about the malformed part.
        msg: Cow<'static, str>,
    },

    /// Memory for the image (or for hook trampolines) could not be obtained.
    Allocation {
        /// A descriptive message about the failed allocation.
        msg: Cow<'static, str>,
    },

    /// The image could not be placed at the requested base address.
    Placement {
        /// The address the caller asked for.
        requested: usize,
        /// The address the system offered instead, or 0 if it offered none.
        actual: usize,
    },

    /// An operation was invoked out of sequence, e.g. relocating twice.
    State {
        /// A descriptive message about the rejected transition.
        msg: Cow<'static, str>,
    },

    /// An import has no match in the supplied symbol table.
    UnresolvedSymbol {
        /// The name of the first missing import, in symbol table order.
        name: String,
    },

    /// A relocation record could not be applied.
    ///
    /// This typically indicates:
    /// * An unsupported relocation type
    /// * A PC-relative value that does not fit its field
    Relocation {
        /// A descriptive message about the relocation error.
        msg: Cow<'static, str>,
    },

    /// Changing the protection of, or releasing, a mapped region failed.
    Mmap {
        /// A descriptive message about the memory mapping error.
        msg: Cow<'static, str>,
    },

    /// A hook could not be installed at the requested address.
    Hook {
        /// A descriptive message about the hook error.
        msg: Cow<'static, str>,
    },

    /// An error occurred in a user-defined callback or handler.
    Custom {
        /// A descriptive message about the custom error.
        msg: Cow<'static, str>,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Format { msg } => write!(f, "Format error: {msg}"),
            Error::Allocation { msg } => write!(f, "Allocation error: {msg}"),
            Error::Placement { requested, actual } => write!(
                f,
                "Placement error: requested base 0x{requested:x}, got 0x{actual:x}"
            ),
            Error::State { msg } => write!(f, "State error: {msg}"),
            Error::UnresolvedSymbol { name } => write!(f, "Unresolved symbol: [{name}]"),
            Error::Relocation { msg } => write!(f, "Relocation error: {msg}"),
            Error::Mmap { msg } => write!(f, "Memory mapping error: {msg}"),
            Error::Hook { msg } => write!(f, "Hook error: {msg}"),
            Error::Custom { msg } => write!(f, "Custom error: {msg}"),
        }
    }
}

impl core::error::Error for Error {}

#[cold]
#[inline(never)]
pub(crate) fn format_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Format { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn allocation_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Allocation { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn state_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::State { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn relocate_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Relocation { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn mmap_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Mmap { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn hook_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Hook { msg: msg.into() }
}

/// Creates a custom error with the specified message.
///
/// Intended for [`LoadHook`](crate::LoadHook) implementations that want to
/// abort a load. The slot helpers report out-of-range offsets with it too.
#[cold]
#[inline(never)]
pub fn custom_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Custom { msg: msg.into() }
}
