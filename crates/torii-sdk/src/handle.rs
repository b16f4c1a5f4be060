//! Opaque host-object handles

/// Raw reference to a host-runtime object.
///
/// A handle is just a number the host runtime can resolve; it carries no
/// ownership. Durable ownership is expressed through
/// [`HostRuntime::new_ref`](crate::HostRuntime::new_ref) /
/// [`HostRuntime::delete_ref`](crate::HostRuntime::delete_ref) pairs.
/// Zero is the null sentinel and never names a live object.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostHandle(u64);

impl HostHandle {
    /// The null handle
    pub const NULL: HostHandle = HostHandle(0);

    /// Wrap a raw handle value
    pub const fn from_raw(raw: u64) -> Self {
        HostHandle(raw)
    }

    /// The raw handle value
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this is the null sentinel
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl Default for HostHandle {
    fn default() -> Self {
        Self::NULL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_sentinel() {
        assert!(HostHandle::NULL.is_null());
        assert!(HostHandle::from_raw(0).is_null());
        assert!(!HostHandle::from_raw(1).is_null());
        assert_eq!(HostHandle::from_raw(17).raw(), 17);
    }
}
