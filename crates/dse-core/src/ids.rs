//! Opaque identifiers used across the engine.
//!
//! Every catalog-scoped entity (queries, shared plans, subplans, pipelines,
//! operators, origins, topology nodes, network partitions) is addressed by a
//! 64-bit newtype. `0` is reserved as the `INVALID` sentinel for all of them;
//! generators start counting at 1.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Reserved sentinel, never handed out by a generator.
            pub const INVALID: $name = $name(0);

            pub const fn new(raw: u64) -> Self {
                $name(raw)
            }

            pub const fn raw(self) -> u64 {
                self.0
            }

            pub fn is_valid(self) -> bool {
                self.0 != 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                $name(raw)
            }
        }
    };
}

define_id!(
    /// A user query registered with the coordinator.
    QueryId
);
define_id!(
    /// A merged plan shared by one or more user queries.
    SharedQueryId
);
define_id!(
    /// A decomposed fragment of a shared plan placed on one worker.
    SubPlanId
);
define_id!(
    /// A compiled operator pipeline inside one subplan.
    PipelineId
);
define_id!(
    /// A single operator node of a logical plan.
    OperatorId
);
define_id!(
    /// A data origin (physical source instance) stamped into buffer headers.
    OriginId
);
define_id!(
    /// A node of the worker topology. Node 1 is the coordinator root.
    TopologyNodeId
);
define_id!(
    /// One partition of a network channel between two placed operators.
    PartitionId
);

/// Identity of one network channel between two placed operators.
///
/// A downstream receiver registers a partition; the upstream sender opens a
/// channel by announcing the same triple.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Partition {
    pub subplan: SubPlanId,
    pub operator: OperatorId,
    pub partition: PartitionId,
}

impl Partition {
    pub fn new(subplan: SubPlanId, operator: OperatorId, partition: PartitionId) -> Self {
        Self {
            subplan,
            operator,
            partition,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.subplan, self.operator, self.partition)
    }
}

/// Monotonic id generator with catalog-local scope.
///
/// Each catalog owns its own generator, so ids are unique per catalog, not
/// globally. The first generated id is 1; 0 stays reserved for `INVALID`.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first.max(1)),
        }
    }

    pub fn next_raw(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next<T: From<u64>>(&self) -> T {
        T::from(self.next_raw())
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_sentinel_is_zero() {
        assert_eq!(QueryId::INVALID.raw(), 0);
        assert!(!QueryId::INVALID.is_valid());
        assert!(QueryId::new(7).is_valid());
    }

    #[test]
    fn generator_is_monotonic_and_skips_invalid() {
        let gen = IdGenerator::new();
        let a: QueryId = gen.next();
        let b: QueryId = gen.next();
        assert_eq!(a.raw(), 1);
        assert_eq!(b.raw(), 2);

        let gen = IdGenerator::starting_at(0);
        let c: OperatorId = gen.next();
        assert!(c.is_valid());
    }
}
