//! Dockling Runtime - container engine implementation.
//!
//! Content-addressed layer and image stores, the Dockerfile builder,
//! container lifecycle management, and the OCI registry client.

#![allow(clippy::result_large_err)]

pub mod build;
pub mod container;
pub mod digest;
pub mod engine;
pub mod fs;
pub mod image;
pub mod layer;
pub mod registry;

// Re-export common types
pub use build::{BuildOptions, BuildReport, Builder, CommandRunner, Dockerfile, HostCommandRunner};
pub use container::{
    ContainerConfig, ContainerFilter, ContainerManager, ContainerRecord, ContainerState,
    ContainerSummary, HostLauncher, ProcessLauncher,
};
pub use digest::{Digest, ImageId, LayerId};
pub use engine::{Backends, Engine, RemoveImageReport};
pub use image::{Image, ImageConfig, ImageReference, ImageStore, ImageSummary};
pub use layer::{LayerStore, Snapshot};
pub use registry::{
    CredentialStore, HttpTransport, MemoryRegistry, PullReport, PushReport, RegistryClient,
    RegistryTransport,
};

/// Dockling Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
