//! Collaborator implementations for a libvirt host
//!
//! - [`VirshHypervisor`]: snapshot lifecycle through the `virsh` CLI
//! - [`FileBlockCopier`]: chunked, sparse-aware image copy

mod file_copier;
mod virsh;

pub use file_copier::FileBlockCopier;
pub use virsh::VirshHypervisor;
