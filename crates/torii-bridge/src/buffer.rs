//! Buffer serializer
//!
//! A growable byte buffer with an explicit size/capacity contract, used to
//! capture compiled chunks and to stage bytes for cross-runtime handoff.
//! Capacity grows by doubling; both the size addition and the doubling are
//! overflow-checked and fail closed, leaving the buffer unmodified and
//! marked failed. A failed buffer rejects every further write.

use torii_vm::{ChunkSink, Function, Value, Vm};

use crate::error::{BridgeError, BridgeResult};

/// Initial capacity of a dump buffer
pub const DUMP_BUFFER_INITIAL: usize = 4096;

/// Buffer failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// The requested size arithmetic wrapped
    #[error("buffer size overflow")]
    Overflow,

    /// The allocator refused the requested capacity
    #[error("out of memory growing buffer to {0} bytes")]
    OutOfMemory(usize),

    /// The buffer already failed; the write was rejected
    #[error("write into a failed buffer")]
    Failed,

    /// The value offered for dumping has no compiled form
    #[error("value is not a compiled function")]
    NotCompiled,
}

/// Smallest doubling of `capacity` that reaches `required`, or `None` when
/// the doubling wraps (or the capacity is zero and can never reach it)
fn next_capacity(mut capacity: usize, required: usize) -> Option<usize> {
    while capacity > 0 && capacity < required {
        capacity = capacity.checked_mul(2)?;
    }
    if capacity >= required {
        Some(capacity)
    } else {
        None
    }
}

/// Growable byte buffer with `size <= capacity` maintained as an invariant
#[derive(Debug)]
pub struct DumpBuffer {
    bytes: Vec<u8>,
    capacity: usize,
    error: Option<BufferError>,
}

impl DumpBuffer {
    /// Create a buffer with the default initial capacity
    pub fn new() -> Result<Self, BufferError> {
        Self::with_capacity(DUMP_BUFFER_INITIAL)
    }

    /// Create a buffer with an explicit initial capacity
    pub fn with_capacity(capacity: usize) -> Result<Self, BufferError> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(capacity)
            .map_err(|_| BufferError::OutOfMemory(capacity))?;
        Ok(Self {
            bytes,
            capacity,
            error: None,
        })
    }

    /// Bytes written so far
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Current logical capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether a previous write failed
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    /// The recorded failure, if any
    pub fn last_error(&self) -> Option<BufferError> {
        self.error
    }

    /// The buffer contents
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the buffer, transferring ownership of its contents
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Append `chunk`, growing capacity by doubling as needed.
    ///
    /// Writes are associative: any split of a byte sequence across calls
    /// produces the same contents as one call. On failure the contents are
    /// unchanged and the buffer is marked failed.
    pub fn write(&mut self, chunk: &[u8]) -> Result<(), BufferError> {
        if self.error.is_some() {
            return Err(BufferError::Failed);
        }
        let new_size = match self.size().checked_add(chunk.len()) {
            Some(n) => n,
            None => return Err(self.fail(BufferError::Overflow)),
        };
        if new_size > self.capacity {
            let new_capacity = match next_capacity(self.capacity, new_size) {
                Some(c) => c,
                None => return Err(self.fail(BufferError::Overflow)),
            };
            if self
                .bytes
                .try_reserve_exact(new_capacity - self.size())
                .is_err()
            {
                return Err(self.fail(BufferError::OutOfMemory(new_capacity)));
            }
            self.capacity = new_capacity;
        }
        self.bytes.extend_from_slice(chunk);
        Ok(())
    }

    fn fail(&mut self, error: BufferError) -> BufferError {
        self.error = Some(error);
        error
    }
}

impl ChunkSink for DumpBuffer {
    fn write(&mut self, bytes: &[u8]) -> bool {
        DumpBuffer::write(self, bytes).is_ok()
    }
}

/// Serialize the callable value at the top of the stack into its
/// compiled-bytecode form.
///
/// Pops the value. Fails when it is not a compiled function or on any
/// buffer failure; a failed buffer is released here, never handed back.
pub fn dump_to_buffer(vm: &mut Vm) -> BridgeResult<DumpBuffer> {
    let is_compiled = match vm.peek(0) {
        Some(Value::Function(f)) => matches!(&**f, Function::Script { .. }),
        _ => false,
    };
    if !is_compiled {
        vm.pop();
        return Err(BufferError::NotCompiled.into());
    }
    let mut buffer = DumpBuffer::new()?;
    let outcome = vm.dump_function(&mut buffer);
    vm.pop();
    match outcome {
        Ok(()) => Ok(buffer),
        Err(vm_err) => Err(match buffer.last_error() {
            Some(buffer_err) => buffer_err.into(),
            None => BridgeError::Vm(vm_err),
        }),
    }
}

/// Load dumped bytes back as a script function under `name`
pub fn load_buffer(vm: &mut Vm, bytes: &[u8], name: &str) -> BridgeResult<()> {
    vm.load_chunk(bytes, name)?;
    Ok(())
}
