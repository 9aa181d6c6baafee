use std::path::{Path, PathBuf};

use getset::Getters;
use tokio::{fs, sync::OnceCell};

use crate::{utils::run_command, WarrenResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The file name of the host private key.
const HOST_KEY_FILENAME: &str = "id_ed25519";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The host SSH keypair authorized inside every guest.
///
/// Generated lazily on first use and shared read-only by all sandboxes for
/// the lifetime of the process; concurrent first users are serialized by the
/// cell so the keypair is only ever generated once.
#[derive(Debug)]
pub struct HostKeypair {
    /// The directory the keypair lives in.
    dir: PathBuf,

    /// The lazily generated key material.
    material: OnceCell<KeyMaterial>,
}

/// Paths and content of a generated host keypair.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct KeyMaterial {
    /// The path to the private key used for remote commands.
    private_key_path: PathBuf,

    /// The public key line injected into guest `authorized_keys`.
    public_key: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HostKeypair {
    /// Creates a handle to the keypair stored in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            material: OnceCell::new(),
        }
    }

    /// Returns the key material, generating the keypair on first use.
    pub async fn material(&self) -> WarrenResult<&KeyMaterial> {
        self.material
            .get_or_try_init(|| Self::load_or_generate(&self.dir))
            .await
    }

    async fn load_or_generate(dir: &Path) -> WarrenResult<KeyMaterial> {
        fs::create_dir_all(dir).await?;

        let private_key_path = dir.join(HOST_KEY_FILENAME);
        let public_key_path = private_key_path.with_extension("pub");

        if !fs::try_exists(&private_key_path).await? {
            tracing::info!("generating host keypair at {}", private_key_path.display());
            run_command(
                "ssh-keygen",
                &[
                    "-q",
                    "-t",
                    "ed25519",
                    "-N",
                    "",
                    "-C",
                    "warren-host",
                    "-f",
                    &private_key_path.display().to_string(),
                ],
            )
            .await?;
        }

        let public_key = fs::read_to_string(&public_key_path).await?.trim().to_string();

        Ok(KeyMaterial {
            private_key_path,
            public_key,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
