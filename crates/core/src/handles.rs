//! Opaque handle types and the allocator that hands them out.
//!
//! Handles are plain integers wrapped in newtypes so a federate handle can
//! never be passed where an object instance handle is expected. Handles that
//! identify runtime entities (federates, object instances, retractions,
//! regions) come from a [`HandleAllocator`] scoped to one federation
//! execution and are never reused within it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            /// Raw integer value of the handle.
            pub fn value(self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_handle!(
    /// Identifies a joined federate for the lifetime of a federation execution.
    FederateHandle(u64)
);
define_handle!(
    /// Identifies a registered object instance.
    ObjectInstanceHandle(u64)
);
define_handle!(
    /// Identifies an object class in the FDD.
    ObjectClassHandle(u32)
);
define_handle!(
    /// Identifies an attribute within its object class.
    AttributeHandle(u32)
);
define_handle!(
    /// Identifies an interaction class in the FDD.
    InteractionClassHandle(u32)
);
define_handle!(
    /// Identifies a parameter within its interaction class.
    ParameterHandle(u32)
);
define_handle!(
    /// Opaque region handle used to scope update delivery.
    RegionHandle(u64)
);
define_handle!(
    /// Returned for every timestamp-ordered send; used to retract it.
    MessageRetractionHandle(u64)
);

/// Handles that can be produced by a [`HandleAllocator`].
pub trait AllocatedHandle: Copy {
    /// Build the handle from its raw value.
    fn from_raw(raw: u64) -> Self;
    /// Raw value of the handle.
    fn raw(self) -> u64;
}

macro_rules! allocated_handle {
    ($($name:ident),*) => {
        $(
            impl AllocatedHandle for $name {
                fn from_raw(raw: u64) -> Self {
                    $name(raw)
                }

                fn raw(self) -> u64 {
                    self.0
                }
            }
        )*
    };
}

allocated_handle!(
    FederateHandle,
    ObjectInstanceHandle,
    RegionHandle,
    MessageRetractionHandle
);

/// Monotonically increasing handle source. The first handle is `1`.
#[derive(Debug, Clone)]
pub struct HandleAllocator<H> {
    next: u64,
    _marker: PhantomData<H>,
}

impl<H: AllocatedHandle> HandleAllocator<H> {
    /// Allocator that starts at handle `1`.
    pub fn new() -> Self {
        Self::resume_from(1)
    }

    /// Allocator whose next handle is `next`, used when restoring a snapshot.
    pub fn resume_from(next: u64) -> Self {
        Self {
            next: next.max(1),
            _marker: PhantomData,
        }
    }

    /// Hand out the next handle.
    pub fn allocate(&mut self) -> H {
        let handle = H::from_raw(self.next);
        self.next += 1;
        handle
    }

    /// Raw value the next call to [`allocate`](Self::allocate) will return.
    pub fn next_value(&self) -> u64 {
        self.next
    }

    /// True if `handle` was handed out by this allocator at some point.
    pub fn has_issued(&self, handle: H) -> bool {
        let raw = handle.raw();
        raw >= 1 && raw < self.next
    }

    /// Never hand out anything at or below `raw`.
    pub fn advance_past(&mut self, raw: u64) {
        self.next = self.next.max(raw.saturating_add(1));
    }
}

impl<H: AllocatedHandle> Default for HandleAllocator<H> {
    fn default() -> Self {
        Self::new()
    }
}
