use std::{env, path::PathBuf, sync::LazyLock};

use super::{WARREN_HOME_DIR, WARREN_HOME_ENV_VAR};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default path where all warren state is stored.
pub static DEFAULT_WARREN_HOME: LazyLock<PathBuf> =
    LazyLock::new(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")).join(WARREN_HOME_DIR));

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the warren home directory, honoring the `WARREN_HOME` override.
pub fn get_warren_home_path() -> PathBuf {
    match env::var(WARREN_HOME_ENV_VAR) {
        Result::Ok(home) => PathBuf::from(home),
        Err(_) => DEFAULT_WARREN_HOME.clone(),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_home_defaults_under_home_dir() {
        if env::var(WARREN_HOME_ENV_VAR).is_err() {
            assert!(get_warren_home_path().ends_with(WARREN_HOME_DIR));
        }
    }
}
