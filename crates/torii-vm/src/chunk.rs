//! Compiled chunks
//!
//! A chunk is the compiled form of a script function. Its byte format is
//! opaque to this surface: the only guarantee is that bytes produced by
//! `Vm::dump_function` load back through `Vm::load_chunk` in the same VM
//! build. Compilation itself happens outside this crate.

/// A compiled script function
pub struct Chunk {
    name: String,
    bytes: Vec<u8>,
}

/// Slice size used when streaming a chunk through a [`ChunkSink`]
pub const DUMP_SLICE: usize = 1024;

impl Chunk {
    /// Wrap already-compiled bytes under a chunk name
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    /// The chunk name (used in diagnostics)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The compiled bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Receiver for streamed chunk bytes.
///
/// `Vm::dump_function` feeds the compiled form through this in bounded
/// slices. Returning `false` aborts the dump; the sink is expected to
/// remember why it failed.
pub trait ChunkSink {
    /// Accept the next slice. Return `false` to abort.
    fn write(&mut self, bytes: &[u8]) -> bool;
}

impl ChunkSink for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) -> bool {
        self.extend_from_slice(bytes);
        true
    }
}
