//! Sandbox core: isolation backends, step supervision and the capacity pool.

pub mod backend;
pub mod provisioner;
pub mod sandbox;
pub mod supervisor;
pub mod types;

pub use provisioner::SandboxProvisioner;
pub use sandbox::SandboxHandle;
