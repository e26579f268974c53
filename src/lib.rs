//! # so_loader
//! Loads prebuilt position-independent ELF shared objects into the current
//! process and wires them up to host code.
//!
//! The pipeline is explicit: [`Loader::load`] maps the image,
//! [`Image::relocate`] applies internal fix-ups, [`Image::resolve`] binds the
//! imports against a caller-supplied [`SymbolLookup`], hooks may be installed
//! on in-image functions, and [`Image::finalize`] flushes caches and applies
//! page protections. Only then may the image's code run.
//!
//! ## Example
//! ```no_run
//! use so_loader::{Loader, symbol_map};
//!
//! extern "C" fn host_puts(_s: *const u8) -> i32 {
//!     0
//! }
//!
//! let bytes = std::fs::read("libgame.so").unwrap();
//! let table = symbol_map! { "puts" => host_puts };
//! let mut image = Loader::new().load("libgame.so", &bytes, None).unwrap();
//! image.relocate().unwrap();
//! image.resolve(&table, false).unwrap();
//! image.finalize().unwrap();
//! let answer = unsafe { image.get::<extern "C" fn() -> i32>("answer").unwrap() };
//! println!("{}", answer());
//! ```
#![no_std]
extern crate alloc;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "arm")))]
compile_error!("unsupport arch");

mod arch;
mod dynamic;
pub mod elf;
mod error;
mod hook;
mod image;
mod loader;
mod macros;
pub mod mmap;
mod os;
mod relocation;
mod segment;
mod slot;
mod symbol;

pub(crate) use error::*;
pub use error::{Error, custom_error};
pub use hook::{CallStrategy, HookHandle, HookInstaller};
pub use image::{Image, ImageState};
pub use loader::{LoadHook, LoadHookContext, Loader};
pub use segment::{ImageSegments, Segment};
pub use slot::{SlotBlock, read_slot, write_slot};
pub use symbol::{Or, Symbol, SymbolLookup, SymbolMap};

/// A type alias for `Result`s returned by `so_loader` functions.
pub type Result<T> = core::result::Result<T, Error>;
