//! The message-passing core of the tile production engine.
//!
//! Each actor is a plain struct with a closed message enum, processed one
//! message at a time to completion by a single tokio task. Actors never
//! block on work: CPU-bound payloads are handed to a worker pool and the
//! actor resumes only when the pool posts a completion message back into
//! its mailbox. All cross-actor coordination is message delivery, never
//! shared mutable memory; the one exception is the production-array slot
//! shared with in-place pool workers, which is owned by the Resampler and
//! only read back inside its own loop.
//!
//! Every actor exposes a stable address of the form `/Raster<id>/<Role>`,
//! used in logs and as part of the pool job identity.

pub mod computer;
pub mod producer;
pub mod resampler;
pub mod writer;

pub use computer::{ActorComputer, ComputerMsg};
pub use producer::{ActorProducer, ProducedArray, ProducedResult, ProduceError, ProducerMsg};
pub use resampler::{ActorResampler, ResamplerMsg};
pub use writer::{ActorWriter, WriterMsg};

/// Identity of the raster a group of actors serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RasterId(pub u64);

impl std::fmt::Display for RasterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Raster{}", self.0)
    }
}

/// Role of an actor within its raster's actor group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Computer,
    Resampler,
    Producer,
    Writer,
}

impl Role {
    fn name(&self) -> &'static str {
        match self {
            Role::Computer => "Computer",
            Role::Resampler => "Resampler",
            Role::Producer => "Producer",
            Role::Writer => "Writer",
        }
    }
}

/// Stable actor address, rendered as `/Raster<id>/<Role>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActorAddress {
    pub raster: RasterId,
    pub role: Role,
}

impl ActorAddress {
    pub fn new(raster: RasterId, role: Role) -> Self {
        Self { raster, role }
    }
}

impl std::fmt::Display for ActorAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}/{}", self.raster, self.role.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_rendering() {
        let addr = ActorAddress::new(RasterId(3), Role::Resampler);
        assert_eq!(addr.to_string(), "/Raster3/Resampler");
    }

    #[test]
    fn test_address_identity() {
        let a = ActorAddress::new(RasterId(1), Role::Computer);
        let b = ActorAddress::new(RasterId(1), Role::Computer);
        let c = ActorAddress::new(RasterId(1), Role::Writer);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
