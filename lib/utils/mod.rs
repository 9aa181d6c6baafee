//! Utility functions, path constants and small helpers.

mod cmd;
mod env;
mod poll;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use cmd::*;
pub use env::*;
pub use poll::*;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The directory under the warren home where all warren state lives.
pub const WARREN_HOME_DIR: &str = ".warren";

/// The environment variable that overrides the warren home directory.
pub const WARREN_HOME_ENV_VAR: &str = "WARREN_HOME";

/// The environment variable holding the optional gateway API key injected into guests.
pub const GATEWAY_API_KEY_ENV_VAR: &str = "WARREN_GATEWAY_API_KEY";

/// The sub directory where private sandbox disk images are created.
pub const IMAGES_SUBDIR: &str = "images";

/// The sub directory where disk images are loop-mounted while being staged.
pub const STAGING_SUBDIR: &str = "staging";

/// The sub directory where hypervisor control sockets are created.
pub const SOCKETS_SUBDIR: &str = "sockets";

/// The sub directory where per-run log artifacts are written, one dir per owner.
pub const LOG_SUBDIR: &str = "log";

/// The sub directory where the host SSH keypair is kept.
pub const KEYS_SUBDIR: &str = "keys";

/// The sub directory where task payloads are spooled before upload.
pub const SPOOL_SUBDIR: &str = "spool";

/// The fixed guest path the task payload is uploaded to.
pub const GUEST_PAYLOAD_PATH: &str = "/tmp/task-payload";

/// The fixed in-guest entry script handed the uploaded payload.
pub const GUEST_ENTRY_PATH: &str = "/usr/local/bin/sandbox-entry";

/// The guest directory caller workspaces are conventionally mounted under.
pub const GUEST_WORKSPACE_DIR: &str = "/workspace";

/// The guest-relative path (no leading slash) of the staged-at marker file.
///
/// Written during staging so the in-guest mtime fallback for changed-path
/// detection has a fixed reference point.
pub const GUEST_STAGE_STAMP: &str = "etc/.staged";

/// The guest-relative path of the injected session credential directory.
pub const GUEST_CREDENTIALS_DIR: &str = "root/.session";

/// The guest-relative path of the injected gateway API key file.
pub const GUEST_GATEWAY_KEY_PATH: &str = "root/.gateway-key";
