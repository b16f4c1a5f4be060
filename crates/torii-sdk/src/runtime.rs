//! HostRuntime trait — abstract host-runtime operations
//!
//! Defines the interface the bridge programs against. A concrete host
//! (a managed runtime with reflection, or the in-process mock used by the
//! test suite) implements this trait; the bridge never depends on host
//! internals.

use torii_vm::Vm;

use crate::error::HostResult;
use crate::handle::HostHandle;

/// One reflection-dispatch request.
///
/// This is the entire surface through which attribute resolution, method
/// invocation and construction are delegated to the host runtime. Extra
/// operands (assigned values, element indices, call arguments) travel on the
/// script stack; the host pushes its results there too.
#[derive(Debug, Clone, Copy)]
pub enum DispatchOp<'a> {
    /// Read a static attribute (field, method, nested type) of a class
    ClassIndex {
        /// The class handle
        class: HostHandle,
        /// Attribute name
        name: &'a str,
    },
    /// Write a static field of a class; the value is on the stack
    ClassNewIndex {
        /// The class handle
        class: HostHandle,
        /// Field name
        name: &'a str,
    },
    /// Construct an instance; constructor arguments are on the stack
    Construct {
        /// The class handle
        class: HostHandle,
    },
    /// Read an attribute of an object instance
    ObjectIndex {
        /// The object handle
        object: HostHandle,
        /// Attribute name
        name: &'a str,
    },
    /// Write a field of an object instance; the value is on the stack
    ObjectNewIndex {
        /// The object handle
        object: HostHandle,
        /// Field name
        name: &'a str,
    },
    /// The host-defined length of an object (collection size and the like)
    ObjectLength {
        /// The object handle
        object: HostHandle,
    },
    /// Read an array element; the element index is on the stack
    ArrayIndex {
        /// The array handle
        array: HostHandle,
    },
    /// Write an array element; index and value are on the stack
    ArrayNewIndex {
        /// The array handle
        array: HostHandle,
    },
    /// Invoke a host callable; call arguments are on the stack
    CallFunction {
        /// The callable handle
        function: HostHandle,
    },
}

/// Abstract host runtime.
///
/// # Return-count convention
///
/// `dispatch`, `bind_class` and `load_module` follow the callback contract:
/// a non-negative return is the number of results the host pushed onto the
/// script stack; a negative return means a host exception is now pending and
/// must be collected through `pending_exception` / `clear_exception`. The
/// two channels are independent — a call can return a non-negative count and
/// still leave an exception pending, so callers must always consult the
/// exception state as well.
///
/// # Threading
///
/// Implementations are shared process-wide (`Send + Sync`). Calls may block
/// the calling OS thread on the host runtime's own synchronization; the
/// script VM passed to `dispatch` is only ever driven by one thread at a
/// time, which the embedder guarantees.
pub trait HostRuntime: Send + Sync {
    /// Attach the calling OS thread to the host runtime.
    ///
    /// Idempotent and safe to race from multiple threads; repeated calls
    /// from an attached thread are cheap no-ops.
    fn attach_current_thread(&self) -> HostResult<()>;

    // ========================================================================
    // Durable references
    // ========================================================================

    /// Acquire a durable reference to `handle`, preventing collection of the
    /// referent until `delete_ref`. Returns `None` when the host cannot
    /// grant one (reference table exhausted or referent already collected).
    fn new_ref(&self, handle: HostHandle) -> Option<HostHandle>;

    /// Release a durable reference. Releasing an already-released or null
    /// handle is host-defined; the bridge never does either.
    fn delete_ref(&self, handle: HostHandle);

    /// Whether two handles name the same host object (identity, not
    /// structural equality)
    fn same_object(&self, a: HostHandle, b: HostHandle) -> bool;

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// The host's string rendering of an object (`toString` equivalent).
    /// `None` means the rendering itself raised; the exception is pending.
    fn describe(&self, handle: HostHandle) -> Option<String>;

    /// Fully-qualified name of a class handle
    fn class_name(&self, class: HostHandle) -> Option<String>;

    /// Element count of an array handle. `None` means the handle is not an
    /// array; the exception is pending.
    fn array_length(&self, array: HostHandle) -> Option<usize>;

    // ========================================================================
    // Exception state
    // ========================================================================

    /// The currently pending exception object, if any. Does not clear it.
    fn pending_exception(&self) -> Option<HostHandle>;

    /// Clear the pending exception state
    fn clear_exception(&self);

    // ========================================================================
    // Reflection dispatch
    // ========================================================================

    /// Execute one dispatch request against `vm`'s stack
    fn dispatch(&self, vm: &mut Vm, op: DispatchOp<'_>) -> i32;

    // ========================================================================
    // Classpath
    // ========================================================================

    /// Resolve a fully-qualified class name and push it wrapped onto `vm`'s
    /// stack. Returns the pushed count (0 when the class does not exist
    /// without that being an error) or negative with an exception pending.
    fn bind_class(&self, vm: &mut Vm, name: &str) -> i32;

    /// Offer an unresolved module name to the host's classpath; on success
    /// the host pushes the module's loader result(s)
    fn load_module(&self, vm: &mut Vm, name: &str) -> i32;
}
