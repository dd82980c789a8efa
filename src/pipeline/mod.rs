pub mod compiler;
pub mod launcher;
pub mod orchestrator;
pub mod params;
pub mod resolver;
mod types;
pub mod volume;

pub use compiler::{CompiledCommand, compile, compile_at};
pub use orchestrator::{Orchestrator, write_summary};
pub use params::{BoundParameters, RawParameter, bind, parse_raw};
pub use resolver::resolve;
pub use types::{
    EntryOutcome, EntryStatus, MountSource, ResolvedTool, RunContext, RunOutcome, RunRequest,
    RunState, RunSummary, Stage, StorageStrategy,
};
