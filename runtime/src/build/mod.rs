//! Image building from Dockerfiles.
//!
//! - `dockerfile`: recipe parsing and variable substitution
//! - `context`: build context loading and COPY semantics
//! - `cache`: instruction cache keys and the persisted index
//! - `runner`: `RUN` execution
//! - `engine`: the stage-by-stage build loop

pub mod cache;
pub mod context;
pub mod dockerfile;
pub mod engine;
pub mod runner;

pub use cache::BuildCache;
pub use context::BuildContext;
pub use dockerfile::{CommandForm, Dockerfile, Instruction};
pub use engine::{BaseImageSource, BuildOptions, BuildReport, Builder};
pub use runner::{CommandRunner, HostCommandRunner, RunRequest};
