//! Torii script VM surface
//!
//! This crate models the embeddable script VM at its interface boundary:
//! - Untyped value model (nil, boolean, number, string, table, function,
//!   userdata) with string-by-content and reference-by-identity semantics
//! - Value stack with a configurable growth ceiling
//! - Insertion-ordered tables with metatables
//! - Metamethod-aware operations (index, new-index, call, equality,
//!   to-string, length, concatenation)
//! - Native functions with upvalues, protected calls
//! - Opaque compiled chunks with streaming dump and load hooks
//! - Userdata finalizers
//!
//! The interpreter and compiler live elsewhere; nothing in this crate
//! executes bytecode.

#![warn(rust_2018_idioms)]

pub mod chunk;
pub mod error;
pub mod table;
pub mod value;
pub mod vm;

pub use chunk::{Chunk, ChunkSink, DUMP_SLICE};
pub use error::{VmError, VmResult};
pub use table::Table;
pub use value::{fmt_number, Finalizer, Function, NativeFn, TableRef, UserData, UserDataRef, Value};
pub use vm::{Vm, VmId, VmOptions};
