//! Config for the collection catalog.

/// Default maximum depth of a chain of views defined on other views.
pub const DEFAULT_MAX_VIEW_DEPTH: usize = 20;

/// Default maximum size, in bytes, of the combined pipelines along a view chain.
pub const DEFAULT_MAX_VIEW_PIPELINE_BYTES: usize = 16 * 1024 * 1024;

/// CLI config for the collection catalog.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct CatalogConfig {
    /// Maximum number of views that may be chained on top of each other.
    #[clap(
        long = "max-view-depth",
        env = "DOCCAT_MAX_VIEW_DEPTH",
        default_value_t = DEFAULT_MAX_VIEW_DEPTH,
        action
    )]
    pub max_view_depth: usize,

    /// Maximum size in bytes of all pipelines along a chain of views.
    #[clap(
        long = "max-view-pipeline-bytes",
        env = "DOCCAT_MAX_VIEW_PIPELINE_BYTES",
        default_value_t = DEFAULT_MAX_VIEW_PIPELINE_BYTES,
        action
    )]
    pub max_view_pipeline_bytes: usize,

    /// Profiling level assigned to databases that have no explicit profile settings.
    #[clap(
        long = "default-profile-level",
        env = "DOCCAT_DEFAULT_PROFILE_LEVEL",
        default_value_t = 0,
        value_parser = clap::value_parser!(u8).range(0..=2),
        action
    )]
    pub default_profile_level: u8,
}
