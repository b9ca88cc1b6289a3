//! Dense 1-based handles into the intern tables.
//!
//! An index of 0 means "none" and never dereferences. Indices are assigned
//! in stream order and stay stable for the lifetime of a parse, which is
//! what makes re-parsing and diffing cheap.

use std::fmt;

macro_rules! index_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl $name {
            pub fn is_valid(self) -> bool {
                self.0 != 0
            }

            /// Position in the backing table, `None` for the null index.
            pub fn to_offset(self) -> Option<usize> {
                if self.0 == 0 {
                    None
                } else {
                    Some(self.0 as usize - 1)
                }
            }

            /// Index of the table entry at `offset`.
            pub fn from_offset(offset: usize) -> Self {
                $name(offset as u32 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

index_type!(
    /// Handle into the string table.
    StringIndex
);
index_type!(
    /// Handle into the instruction pointer table.
    IpIndex
);
index_type!(
    /// Handle into the trace tree; the parent of a node is always a smaller
    /// index, 0 is the synthetic root.
    TraceIndex
);

/// String handles for the different roles a string can play. The analyzer
/// keeps one table for all of them.
pub type ModuleIndex = StringIndex;
pub type FunctionIndex = StringIndex;
pub type FileIndex = StringIndex;

/// Position into the `allocations` vector. Unlike the interned indices this
/// is 0-based: allocation records are append-only, so positions are stable.
pub type AllocationIndex = u32;

/// Position into the `allocation_infos` vector, as referenced by new-format
/// `+`/`-` lines. 0-based for the same reason.
pub type AllocationInfoIndex = u32;
