//! `warren` runs one task in a fresh ephemeral sandbox and prints its output.
//!
//! ## Usage
//!
//! ```bash
//! warren run \
//!     --hypervisor /usr/bin/firecracker \
//!     --kernel /var/lib/warren/vmlinux \
//!     --base-image /var/lib/warren/base.ext4 \
//!     --owner alice \
//!     --mount /srv/shared/project:/workspace \
//!     --allow /srv/shared \
//!     "make test"
//!
//! warren check \
//!     --hypervisor /usr/bin/firecracker \
//!     --kernel /var/lib/warren/vmlinux \
//!     --base-image /var/lib/warren/base.ext4
//! ```

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use clap::{Parser, Subcommand};
use warren::{
    config::{Mount, OrchestratorConfig},
    orchestrator::SandboxOrchestrator,
    policy::PrefixAllowlistPolicy,
    system,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Arguments for the warren command.
#[derive(Debug, Parser)]
#[command(name = "warren", author)]
struct WarrenArgs {
    /// The subcommand to run.
    #[command(subcommand)]
    subcommand: WarrenSubcommand,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
enum WarrenSubcommand {
    /// Run a task in a fresh sandbox
    Run {
        /// Path to the hypervisor binary
        #[arg(long)]
        hypervisor: PathBuf,

        /// Path to the guest kernel image
        #[arg(long)]
        kernel: PathBuf,

        /// Path to the shared base disk image
        #[arg(long)]
        base_image: PathBuf,

        /// Owner identity the sandbox is bound to
        #[arg(long)]
        owner: String,

        /// Directory mappings (host:guest[:ro] format)
        #[arg(long = "mount")]
        mounts: Vec<String>,

        /// Host path prefixes mounts may be taken from
        #[arg(long = "allow")]
        allowed_prefixes: Vec<PathBuf>,

        /// Per-owner session credential directory
        #[arg(long)]
        credential_dir: Option<PathBuf>,

        /// Task execution budget in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// The task text to run inside the sandbox
        task: String,
    },
    /// Verify host infrastructure without running anything
    Check {
        /// Path to the hypervisor binary
        #[arg(long)]
        hypervisor: PathBuf,

        /// Path to the guest kernel image
        #[arg(long)]
        kernel: PathBuf,

        /// Path to the shared base disk image
        #[arg(long)]
        base_image: PathBuf,
    },
}

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = WarrenArgs::parse();

    match args.subcommand {
        WarrenSubcommand::Run {
            hypervisor,
            kernel,
            base_image,
            owner,
            mounts,
            allowed_prefixes,
            credential_dir,
            timeout_secs,
            task,
        } => {
            let mounts: Vec<Mount> = mounts
                .iter()
                .map(|s| s.parse())
                .collect::<Result<_, _>>()?;

            let config = OrchestratorConfig::builder()
                .hypervisor_path(hypervisor)
                .kernel_path(kernel)
                .base_image_path(base_image)
                .build();

            let policy = Arc::new(PrefixAllowlistPolicy::new(allowed_prefixes));
            let orchestrator = SandboxOrchestrator::new(config, policy).await?;

            let result = orchestrator
                .run_task(
                    &owner,
                    &task,
                    &mounts,
                    credential_dir.as_deref(),
                    timeout_secs.map(Duration::from_secs),
                )
                .await;

            print!("{}", result.get_output());
            if !result.get_files_changed().is_empty() {
                eprintln!("changed files: {}", result.get_files_changed().join(", "));
            }

            orchestrator.shutdown_all().await;
            std::process::exit(*result.get_exit_code());
        }
        WarrenSubcommand::Check {
            hypervisor,
            kernel,
            base_image,
        } => {
            let config = OrchestratorConfig::builder()
                .hypervisor_path(hypervisor)
                .kernel_path(kernel)
                .base_image_path(base_image)
                .build();

            system::check_host_requirements(&config).await?;
            println!("host infrastructure ok");
        }
    }

    Ok(())
}
