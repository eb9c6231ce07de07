//! Crate-wide constants.

/// Application name, used for state directories.
pub const APP_NAME: &str = "kiln";

/// Environment variable overriding the state root.
pub const ROOT_ENV: &str = "KILN_ROOT";

/// Environment variable overriding solver parallelism.
pub const PARALLELISM_ENV: &str = "KILN_PARALLELISM";

/// Environment variable overriding the default snapshotter name.
pub const SNAPSHOTTER_ENV: &str = "KILN_SNAPSHOTTER";

/// Snapshotter used when neither the exporter options nor the environment name one.
pub const DEFAULT_SNAPSHOTTER: &str = "overlayfs";

/// Marker written into a cache entry once all of its outputs are committed.
pub const CACHE_COMPLETE_MARKER: &str = ".kiln-complete";

/// `SOURCE_DATE_EPOCH` used for command environments and layer timestamps.
/// 315532800 = 1980-01-01T00:00:00Z (ZIP epoch).
pub const SOURCE_DATE_EPOCH: u64 = 315_532_800;

/// Default `PATH` inside command environments.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
