// Catalog and settings loading.

pub mod loader;
pub mod types;

pub use loader::{SETTINGS_FILE, check_catalog_files, load_catalogs, load_settings};
pub use types::{
    Catalogs, ParameterSpec, ParameterType, PipelineProfile, Settings, StageEntry, TokenPolicy,
    ToolDefinition,
};
