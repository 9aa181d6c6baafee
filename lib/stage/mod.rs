//! Staging of per-sandbox disk images.
//!
//! Staging clones the shared base image, loop-mounts the private copy,
//! injects credentials, caller mounts and static network configuration, and
//! unmounts before boot. Nothing has booted yet when staging fails, so its
//! own cleanup reduces to unmounting and deleting the partially built image.

use std::{
    env,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::fs;

use crate::{
    config::{Mount, OrchestratorConfig},
    utils::{
        run_command, GATEWAY_API_KEY_ENV_VAR, GUEST_CREDENTIALS_DIR, GUEST_GATEWAY_KEY_PATH,
        GUEST_STAGE_STAMP,
    },
    WarrenResult,
};

mod keys;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use keys::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Prepares the private disk image of a sandbox before boot.
#[async_trait]
pub trait ImageStager: Send + Sync {
    /// Stages a fresh disk image for a sandbox and returns its path.
    ///
    /// The returned image is exclusively owned by the sandbox until teardown
    /// deletes it; the shared base image is never handed out.
    async fn stage(
        &self,
        sandbox_id: u32,
        ip: Ipv4Addr,
        credential_dir: Option<&Path>,
        mounts: &[Mount],
    ) -> WarrenResult<PathBuf>;
}

/// Image stager backed by a byte copy of the base image and a loop mount.
#[derive(Debug)]
pub struct LoopbackStager {
    /// The orchestrator configuration.
    config: Arc<OrchestratorConfig>,

    /// The host keypair whose public half is authorized in every guest.
    keypair: Arc<HostKeypair>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LoopbackStager {
    /// Creates a new stager.
    pub fn new(config: Arc<OrchestratorConfig>, keypair: Arc<HostKeypair>) -> Self {
        Self { config, keypair }
    }

    /// Injects keys, credentials, mounts and network config into the mounted image.
    async fn populate(
        &self,
        root: &Path,
        ip: Ipv4Addr,
        credential_dir: Option<&Path>,
        mounts: &[Mount],
    ) -> WarrenResult<()> {
        // Authorize the host keypair for remote execution.
        let material = self.keypair.material().await?;
        let ssh_dir = root.join("root/.ssh");
        fs::create_dir_all(&ssh_dir).await?;
        set_mode(&ssh_dir, 0o700).await?;

        let authorized_keys = ssh_dir.join("authorized_keys");
        fs::write(&authorized_keys, format!("{}\n", material.get_public_key())).await?;
        set_mode(&authorized_keys, 0o600).await?;

        // Session credentials, skipped when the owner has none.
        if let Some(dir) = credential_dir {
            if fs::try_exists(dir).await? {
                copy_tree(dir, &root.join(GUEST_CREDENTIALS_DIR)).await?;
            } else {
                tracing::warn!("credential dir {} missing, skipping injection", dir.display());
            }
        }

        // Gateway API key, skipped when the process has none.
        match env::var(GATEWAY_API_KEY_ENV_VAR) {
            Result::Ok(key) if !key.is_empty() => {
                let key_path = root.join(GUEST_GATEWAY_KEY_PATH);
                fs::write(&key_path, key).await?;
                set_mode(&key_path, 0o600).await?;
            }
            _ => {}
        }

        // Caller mounts; a missing host path is skipped, not fatal.
        for mount in mounts {
            if !fs::try_exists(mount.get_host()).await? {
                tracing::warn!(
                    "mount host path {} missing, skipping",
                    mount.get_host().display()
                );
                continue;
            }

            let dest = root.join(mount.get_guest().as_str().trim_start_matches('/'));
            copy_tree(mount.get_host(), &dest).await?;
        }

        // Static in-guest networking.
        let network_dir = root.join("etc/systemd/network");
        fs::create_dir_all(&network_dir).await?;
        fs::write(
            network_dir.join("10-eth0.network"),
            render_network_config(
                ip,
                self.config.get_subnet().prefix(),
                self.config.bridge_ip()?,
                *self.config.get_guest_dns(),
            ),
        )
        .await?;

        // Reference point for the in-guest mtime fallback.
        let stamp = root.join(GUEST_STAGE_STAMP);
        if let Some(parent) = stamp.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&stamp, b"").await?;

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Renders the systemd-networkd unit binding the guest's single interface.
pub fn render_network_config(
    ip: Ipv4Addr,
    prefix: u8,
    gateway: Ipv4Addr,
    dns: Ipv4Addr,
) -> String {
    format!(
        "[Match]\nName=eth0\n\n[Network]\nAddress={}/{}\nGateway={}\nDNS={}\n",
        ip, prefix, gateway, dns
    )
}

/// Recursively copies the contents of `src` into `dest`.
async fn copy_tree(src: &Path, dest: &Path) -> WarrenResult<()> {
    fs::create_dir_all(dest).await?;
    run_command(
        "cp",
        &[
            "-a",
            &format!("{}/.", src.display()),
            &dest.display().to_string(),
        ],
    )
    .await?;
    Ok(())
}

/// Sets UNIX permission bits on a path.
async fn set_mode(path: &Path, mode: u32) -> WarrenResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path).await?.permissions();
    perms.set_mode(mode);
    fs::set_permissions(path, perms).await?;
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ImageStager for LoopbackStager {
    async fn stage(
        &self,
        sandbox_id: u32,
        ip: Ipv4Addr,
        credential_dir: Option<&Path>,
        mounts: &[Mount],
    ) -> WarrenResult<PathBuf> {
        let image = self.config.image_path(sandbox_id);
        fs::create_dir_all(self.config.images_dir()).await?;
        if let Err(e) = fs::copy(self.config.get_base_image_path(), &image).await {
            // A copy interrupted partway, e.g. by a full disk, must not
            // leave the truncated image behind.
            let _ = fs::remove_file(&image).await;
            return Err(e.into());
        }

        let scratch = self.config.staging_dir().join(format!("sandbox-{}", sandbox_id));
        fs::create_dir_all(&scratch).await?;

        if let Err(e) = run_command(
            "mount",
            &[
                "-o",
                "loop",
                &image.display().to_string(),
                &scratch.display().to_string(),
            ],
        )
        .await
        {
            let _ = fs::remove_file(&image).await;
            let _ = fs::remove_dir(&scratch).await;
            return Err(e);
        }

        let outcome = self.populate(&scratch, ip, credential_dir, mounts).await;

        // The unmount and scratch removal run no matter how population went,
        // so a failed stage never leaves a stale loop mount behind.
        if let Err(e) = run_command("umount", &[&scratch.display().to_string()]).await {
            tracing::error!("failed to unmount {}: {}", scratch.display(), e);
        }
        if let Err(e) = fs::remove_dir(&scratch).await {
            tracing::warn!("failed to remove scratch dir {}: {}", scratch.display(), e);
        }

        match outcome {
            Result::Ok(()) => {
                tracing::info!("staged image {} for sandbox {}", image.display(), sandbox_id);
                Ok(image)
            }
            Err(e) => {
                let _ = fs::remove_file(&image).await;
                Err(e)
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::{config::OrchestratorConfig, WarrenError};

    use super::*;

    fn test_config(home: &Path) -> Arc<OrchestratorConfig> {
        Arc::new(
            OrchestratorConfig::builder()
                .hypervisor_path("/usr/bin/firecracker")
                .kernel_path("/vmlinux")
                .base_image_path("/base.ext4")
                .home_dir(home)
                .build(),
        )
    }

    #[test]
    fn test_stage_network_config_binds_static_identity() {
        let rendered = render_network_config(
            "172.30.0.5".parse().unwrap(),
            24,
            "172.30.0.1".parse().unwrap(),
            "1.1.1.1".parse().unwrap(),
        );

        assert!(rendered.contains("Name=eth0"));
        assert!(rendered.contains("Address=172.30.0.5/24"));
        assert!(rendered.contains("Gateway=172.30.0.1"));
        assert!(rendered.contains("DNS=1.1.1.1"));
    }

    #[tokio::test]
    async fn test_stage_populate_injects_key_mounts_and_stamp() -> anyhow::Result<()> {
        if which::which("ssh-keygen").is_err() {
            return Ok(());
        }

        let home = tempfile::tempdir()?;
        let root = tempfile::tempdir()?;
        let source = tempfile::tempdir()?;
        tokio::fs::write(source.path().join("file.txt"), "seeded").await?;

        let config = test_config(home.path());
        let keypair = Arc::new(HostKeypair::new(config.keys_dir()));
        let stager = LoopbackStager::new(config, keypair);

        let mounts = vec![
            Mount::new(source.path(), "/workspace"),
            // Host path does not exist; must be skipped, not fatal.
            Mount::new("/definitely/not/here", "/missing"),
        ];

        stager
            .populate(root.path(), "172.30.0.2".parse()?, None, &mounts)
            .await?;

        let authorized = root.path().join("root/.ssh/authorized_keys");
        assert!(tokio::fs::read_to_string(&authorized)
            .await?
            .starts_with("ssh-ed25519"));

        let copied = root.path().join("workspace/file.txt");
        assert_eq!(tokio::fs::read_to_string(&copied).await?, "seeded");

        assert!(!root.path().join("missing").exists());
        assert!(root.path().join(GUEST_STAGE_STAMP).exists());
        assert!(root
            .path()
            .join("etc/systemd/network/10-eth0.network")
            .exists());

        Ok(())
    }

    #[tokio::test]
    async fn test_stage_populate_skips_absent_credential_dir() -> anyhow::Result<()> {
        if which::which("ssh-keygen").is_err() {
            return Ok(());
        }

        let home = tempfile::tempdir()?;
        let root = tempfile::tempdir()?;

        let config = test_config(home.path());
        let keypair = Arc::new(HostKeypair::new(config.keys_dir()));
        let stager = LoopbackStager::new(config, keypair);

        stager
            .populate(
                root.path(),
                "172.30.0.2".parse()?,
                Some(Path::new("/creds/nobody")),
                &[],
            )
            .await?;

        assert!(!root.path().join(GUEST_CREDENTIALS_DIR).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_stage_failed_base_copy_leaves_no_partial_image() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let config = Arc::new(
            OrchestratorConfig::builder()
                .hypervisor_path("/usr/bin/firecracker")
                .kernel_path("/vmlinux")
                .base_image_path(home.path().join("missing-base.ext4"))
                .home_dir(home.path())
                .build(),
        );
        let keypair = Arc::new(HostKeypair::new(config.keys_dir()));
        let stager = LoopbackStager::new(config.clone(), keypair);

        // Leftover bytes from an earlier interrupted copy of the same id.
        tokio::fs::create_dir_all(config.images_dir()).await?;
        tokio::fs::write(config.image_path(9), b"partial").await?;

        let err = stager
            .stage(9, "172.30.0.2".parse()?, None, &[])
            .await
            .unwrap_err();

        assert!(matches!(err, WarrenError::Io(_)));
        assert!(!config.image_path(9).exists());
        Ok(())
    }
}
