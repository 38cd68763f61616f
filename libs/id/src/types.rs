//! Typed ID definitions for cluster resources.

use crate::define_id;

define_id!(
    /// Identifier of a compute node (client) in the cluster.
    NodeId
);

define_id!(
    /// Identifier of a single allocation placed on a node.
    AllocationId
);

// =============================================================================
// Tests
// =============================================================================
