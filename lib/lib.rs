//! `warren` is an ephemeral sandbox orchestrator: given an owner identity
//! and a unit of work, it provisions an isolated, network-attached,
//! file-seeded microVM, executes the work inside it over a remote shell,
//! retrieves results, and tears every allocated resource down - even on
//! failure.
//!
//! # Overview
//!
//! One sandbox is bound to one owner at a time. Provisioning walks a fixed
//! pipeline: allocate a network identity, create a tap device on the shared
//! bridge, clone and stage the base disk image, boot a per-sandbox
//! hypervisor through its control socket, wait for SSH readiness, run the
//! task, copy mutated mounts back out. A guaranteed retirement block then
//! releases the process, device, disk image and control socket, in that
//! order, whatever happened before it.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use warren::{
//!     config::OrchestratorConfig,
//!     orchestrator::SandboxOrchestrator,
//!     policy::PrefixAllowlistPolicy,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = OrchestratorConfig::builder()
//!         .hypervisor_path("/usr/bin/firecracker")
//!         .kernel_path("/var/lib/warren/vmlinux")
//!         .base_image_path("/var/lib/warren/base.ext4")
//!         .build();
//!
//!     let policy = Arc::new(PrefixAllowlistPolicy::new([("/srv/shared").into()]));
//!     let orchestrator = SandboxOrchestrator::new(config, policy).await?;
//!
//!     let result = orchestrator
//!         .run_task("alice", "echo ok", &[], None, None)
//!         .await;
//!     println!("{}", result.get_output());
//!
//!     orchestrator.shutdown_all().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`] - Orchestrator configuration, defaults and mount specs
//! - [`net`] - Sandbox network identity allocation and tap devices
//! - [`stage`] - Disk image staging and the shared host keypair
//! - [`vmm`] - Per-sandbox hypervisor subprocess control
//! - [`exec`] - Remote execution inside the guest
//! - [`policy`] - Mount allowlist validation seam
//! - [`orchestrator`] - Lifecycle registry and caller API
//! - [`system`] - Startup host infrastructure checks
//! - [`utils`] - Path constants and small helpers

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod config;
pub mod exec;
pub mod net;
pub mod orchestrator;
pub mod policy;
pub mod stage;
pub mod system;
pub mod utils;
pub mod vmm;

pub use error::*;
