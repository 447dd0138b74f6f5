// src/constants.rs

use std::time::Duration;

/// The configuration file looked up in the working directory by default.
pub const DEFAULT_CONFIG_FILENAME: &str = "titan.yaml";

/// The directory (under the system config dir) holding the fallback configuration.
pub const CONFIG_DIR_NAME: &str = "titan";

/// Prefix for the temporary files action scripts are written to.
pub const TEMP_SCRIPT_PREFIX: &str = "titan-action-";

/// Prepended to every composed action script before it is executed.
pub const SCRIPT_PREAMBLE: &str = "#!/bin/bash\nset -e\n";

pub const DEFAULT_FETCH_SCRIPT: &str = "git fetch -p && git pull
git fetch --tags --force && git fetch --prune --prune-tags
";

pub const DEFAULT_CLEAN_SCRIPT: &str = "find \"$(pwd)\" -maxdepth 3 -name \"node_modules\" -type d -prune -exec rm -rf {} +
find \"$(pwd)\" -maxdepth 3 -name \"dist\" -type d -prune -exec rm -rf {} +
";

pub const DEFAULT_INSTALL_SCRIPT: &str = "pnpm install --frozen-lockfile --prefer-offline\n";

pub const DEFAULT_BUILD_SCRIPT: &str = "pnpm run build:local\n";

/// How long listeners get to finish in-flight requests on shutdown.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Largest request body the proxy buffers before forwarding.
pub const MAX_PROXY_BODY_BYTES: usize = 64 * 1024 * 1024;
