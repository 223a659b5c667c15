pub const APP_NAME: &str = "fluxnix";

/// Marker that prefixes every structured line nix writes to stderr
/// when run with `--log-format internal-json`.
pub const NIX_LOG_PREFIX: &[u8] = b"@nix ";

/// The build output that gets packaged and published.
pub const PRIMARY_OUTPUT: &str = "out";

pub const ARCHIVE_EXTENSION: &str = "tar.gz";

pub const DEFAULT_BUILD_COMMAND: &str = "nix";

/// Fetch retries when nothing is configured.
pub const DEFAULT_FETCH_RETRIES: u32 = 9;
