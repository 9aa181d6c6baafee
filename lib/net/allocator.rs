use std::{
    net::Ipv4Addr,
    sync::atomic::{AtomicU32, Ordering},
};

use getset::Getters;
use ipnetwork::Ipv4Network;

use crate::{WarrenError, WarrenResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Assigns unique sandbox ids and derives their guest addresses.
///
/// Ids are handed out from a monotonic in-memory counter; they are never
/// recycled within a process lifetime, and allocation fails loudly once the
/// usable host range of the subnet is exhausted rather than wrapping. The
/// counter is not persisted - sandboxes never outlive the process, so a
/// restart starting from 1 again is safe.
#[derive(Debug)]
pub struct IdentityAllocator {
    /// The subnet guest addresses are derived from.
    subnet: Ipv4Network,

    /// The next sandbox id to hand out.
    next_id: AtomicU32,
}

/// The network identity of a single sandbox.
///
/// The guest address is a pure function of the sandbox id: the subnet's
/// first usable host is reserved for the bridge, and sandbox `n` takes the
/// host at offset `n + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct SandboxIdentity {
    /// The unique numeric sandbox id.
    sandbox_id: u32,

    /// The guest address derived from the sandbox id.
    ip: Ipv4Addr,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl IdentityAllocator {
    /// Creates a new allocator over the given subnet.
    pub fn new(subnet: Ipv4Network) -> Self {
        Self {
            subnet,
            next_id: AtomicU32::new(1),
        }
    }

    /// The number of sandbox ids the subnet can hold.
    ///
    /// The network address, the bridge address and the broadcast address are
    /// reserved, so a /24 yields 253 usable ids.
    pub fn capacity(&self) -> u32 {
        self.subnet.size().saturating_sub(3)
    }

    /// Allocates the next sandbox identity.
    pub fn allocate(&self) -> WarrenResult<SandboxIdentity> {
        let sandbox_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let limit = self.capacity();

        if sandbox_id > limit {
            return Err(WarrenError::CapacityExhausted { limit });
        }

        // Offset 0 is the network address, offset 1 the bridge.
        let ip = self
            .subnet
            .nth(sandbox_id + 1)
            .ok_or(WarrenError::CapacityExhausted { limit })?;

        Ok(SandboxIdentity { sandbox_id, ip })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
