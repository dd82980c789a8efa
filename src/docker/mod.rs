// Docker runtime boundary: subprocess execution with timeouts, image sync.

pub mod engine;
pub mod images;
pub mod run;
pub mod runtime;
pub mod types;

pub use engine::ensure_available;
pub use images::sync_images;
pub use run::spawn;
pub use runtime::{ContainerRuntime, DockerCli};
pub use types::{ContainerCommand, ContainerResult, OutputLine};
