//! Sandbox lifecycle registry and caller API.
//!
//! The orchestrator owns the only piece of shared mutable state in the
//! crate: the map of live sandboxes keyed by owner. Admission serializes
//! requests per owner, provisioning acquires resources in a fixed order, and
//! a guaranteed retirement block releases every acquired resource on every
//! exit path - success, task error, boot error or infrastructure error.

use std::{
    collections::HashMap,
    net::Ipv4Addr,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, time, time::Instant};

use crate::{
    config::{Mount, OrchestratorConfig},
    exec::{GuestExecutor, SshExecutor},
    net::{IdentityAllocator, IpCommandDeviceManager, NetworkDeviceManager},
    policy::MountPolicy,
    stage::{HostKeypair, ImageStager, LoopbackStager},
    system,
    vmm::{FirecrackerLauncher, HypervisorLauncher},
    WarrenError, WarrenResult,
};

mod resources;
mod runlog;

use resources::SandboxResources;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The outcome of one sandbox invocation, immutable once produced.
///
/// Callers always receive a `TaskResult`, never a propagated panic or raw
/// error: per-task failures are converted into a result whose exit code is
/// non-zero and whose output begins with a human-readable description.
#[derive(Debug, Clone, Getters, Serialize, Deserialize)]
#[getset(get = "pub with_prefix")]
pub struct TaskResult {
    /// The captured output stream of the task.
    output: String,

    /// Best-effort list of guest paths the task modified.
    files_changed: Vec<String>,

    /// The exit code of the task, or a synthesized one on failure.
    exit_code: i32,

    /// How long the invocation ran, in milliseconds.
    duration_ms: u64,
}

/// Read-only status of one live sandbox.
#[derive(Debug, Clone, Getters, Serialize)]
#[getset(get = "pub with_prefix")]
pub struct SandboxStatus {
    /// The owner the sandbox is bound to.
    owner: String,

    /// The sandbox id.
    sandbox_id: u32,

    /// The guest address.
    ip: Ipv4Addr,

    /// When the sandbox was registered.
    started_at: DateTime<Utc>,

    /// Elapsed runtime in milliseconds.
    uptime_ms: u64,
}

/// The per-owner lifecycle slot: absent means `Idle`.
///
/// Each slot carries the admission token of the run that claimed it. A
/// force-teardown can free the owner while that run is still in flight; the
/// token lets the late retirement recognize that the slot now belongs to a
/// successor and must not be evicted.
#[derive(Debug)]
enum SandboxSlot {
    /// A request holds the owner but has not finished booting yet.
    Admitting(u64),

    /// The sandbox is booted and registered.
    Running(u64, LiveSandbox),
}

/// Registry entry for one booted sandbox.
#[derive(Debug, Clone)]
struct LiveSandbox {
    sandbox_id: u32,
    ip: Ipv4Addr,
    device_name: String,
    disk_image_path: std::path::PathBuf,
    control_socket_path: std::path::PathBuf,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
}

/// The ephemeral sandbox orchestrator.
///
/// Provisions one isolated microVM per owner, runs the task inside it over
/// the remote execution bridge, and guarantees teardown of every allocated
/// resource. Concurrent requests for different owners run fully in parallel;
/// a second request for the same owner waits until the first fully retires.
pub struct SandboxOrchestrator {
    /// The orchestrator configuration.
    config: Arc<OrchestratorConfig>,

    /// The sandbox id and address allocator.
    allocator: IdentityAllocator,

    /// The virtual network device backend.
    devices: Arc<dyn NetworkDeviceManager>,

    /// The disk image staging backend.
    stager: Arc<dyn ImageStager>,

    /// The hypervisor backend.
    hypervisor: Arc<dyn HypervisorLauncher>,

    /// The remote execution backend.
    executor: Arc<dyn GuestExecutor>,

    /// The external mount allowlist validator.
    policy: Arc<dyn MountPolicy>,

    /// Live sandboxes keyed by owner.
    live: Mutex<HashMap<String, SandboxSlot>>,

    /// Source of per-admission tokens tagging slot ownership.
    admissions: AtomicU64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TaskResult {
    fn new(output: String, files_changed: Vec<String>, exit_code: i32, duration_ms: u64) -> Self {
        Self {
            output,
            files_changed,
            exit_code,
            duration_ms,
        }
    }

    /// Synthesizes the error-shaped result for a failed invocation.
    fn from_error(error: &WarrenError, duration_ms: u64) -> Self {
        let exit_code = if error.is_timeout() { 124 } else { 1 };
        Self {
            output: format!("error: {}\n", error),
            files_changed: Vec::new(),
            exit_code,
            duration_ms,
        }
    }

    /// Whether the task completed with a zero exit code.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

impl SandboxOrchestrator {
    /// Creates an orchestrator wired to the production host backends.
    ///
    /// Verifies every host prerequisite first; a missing binary, bridge,
    /// kernel or base image is fatal here rather than per-task.
    pub async fn new(
        config: OrchestratorConfig,
        policy: Arc<dyn MountPolicy>,
    ) -> WarrenResult<Self> {
        system::check_host_requirements(&config).await?;

        let config = Arc::new(config);
        let keypair = Arc::new(HostKeypair::new(config.keys_dir()));

        let devices = Arc::new(IpCommandDeviceManager::new(config.get_bridge_name().clone()));
        let stager = Arc::new(LoopbackStager::new(config.clone(), keypair.clone()));
        let hypervisor = Arc::new(FirecrackerLauncher::new(config.clone()));
        let executor = Arc::new(SshExecutor::new(config.clone(), keypair));

        Ok(Self::with_components(
            config, devices, stager, hypervisor, executor, policy,
        ))
    }

    /// Creates an orchestrator over explicit backends.
    ///
    /// Skips the host requirement check; intended for embedding and for
    /// tests that substitute fakes for the privileged host operations.
    pub fn with_components(
        config: Arc<OrchestratorConfig>,
        devices: Arc<dyn NetworkDeviceManager>,
        stager: Arc<dyn ImageStager>,
        hypervisor: Arc<dyn HypervisorLauncher>,
        executor: Arc<dyn GuestExecutor>,
        policy: Arc<dyn MountPolicy>,
    ) -> Self {
        Self {
            allocator: IdentityAllocator::new(*config.get_subnet()),
            config,
            devices,
            stager,
            hypervisor,
            executor,
            policy,
            live: Mutex::new(HashMap::new()),
            admissions: AtomicU64::new(0),
        }
    }

    /// Runs a task in a fresh sandbox for the owner and returns its result.
    ///
    /// Blocks while the owner already has a live sandbox, then provisions,
    /// executes and retires. Every failure class is converted into an
    /// error-shaped [`TaskResult`]; teardown runs unconditionally.
    pub async fn run_task(
        &self,
        owner: &str,
        task: &str,
        mounts: &[Mount],
        credential_dir: Option<&Path>,
        timeout: Option<Duration>,
    ) -> TaskResult {
        let token = self.admit(owner).await;
        let started = Instant::now();

        let mut resources = SandboxResources::default();
        let outcome = self
            .provision_and_execute(
                owner,
                token,
                task,
                mounts,
                credential_dir,
                timeout,
                &mut resources,
            )
            .await;
        self.retire(owner, token, resources).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok((output, exit_code, files_changed)) => {
                TaskResult::new(output, files_changed, exit_code, duration_ms)
            }
            Err(e) => {
                tracing::error!("task for owner {} failed: {}", owner, e);
                TaskResult::from_error(&e, duration_ms)
            }
        };

        runlog::write_run_log(&self.config, owner, &result).await;
        result
    }

    /// Returns the status of every live sandbox.
    pub async fn list_active(&self) -> Vec<SandboxStatus> {
        let live = self.live.lock().await;
        let now = Utc::now();

        live.iter()
            .filter_map(|(owner, slot)| match slot {
                SandboxSlot::Running(_, sandbox) => Some(SandboxStatus {
                    owner: owner.clone(),
                    sandbox_id: sandbox.sandbox_id,
                    ip: sandbox.ip,
                    started_at: sandbox.started_at,
                    uptime_ms: (now - sandbox.started_at).num_milliseconds().max(0) as u64,
                }),
                SandboxSlot::Admitting(_) => None,
            })
            .collect()
    }

    /// Force-tears-down the owner's running sandbox.
    pub async fn kill_sandbox(&self, owner: &str) -> WarrenResult<()> {
        let sandbox = {
            let mut live = self.live.lock().await;
            match live.get(owner) {
                Some(SandboxSlot::Running(..)) => match live.remove(owner) {
                    Some(SandboxSlot::Running(_, sandbox)) => sandbox,
                    _ => unreachable!("slot changed under the registry lock"),
                },
                Some(SandboxSlot::Admitting(_)) | None => {
                    return Err(WarrenError::SandboxNotFound(owner.to_string()))
                }
            }
        };

        tracing::info!("killing sandbox {} for owner {}", sandbox.sandbox_id, owner);
        self.release_live(sandbox).await;
        Ok(())
    }

    /// Drains the registry, tearing down every registered sandbox.
    pub async fn shutdown_all(&self) {
        let running: Vec<(String, LiveSandbox)> = {
            let mut live = self.live.lock().await;
            let owners: Vec<String> = live
                .iter()
                .filter(|(_, slot)| matches!(slot, SandboxSlot::Running(..)))
                .map(|(owner, _)| owner.clone())
                .collect();

            owners
                .into_iter()
                .filter_map(|owner| match live.remove(&owner) {
                    Some(SandboxSlot::Running(_, sandbox)) => Some((owner, sandbox)),
                    _ => None,
                })
                .collect()
        };

        for (owner, sandbox) in running {
            tracing::info!("shutting down sandbox {} for owner {}", sandbox.sandbox_id, owner);
            self.release_live(sandbox).await;
        }
    }

    /// Waits until the owner slot is free, then claims it.
    ///
    /// Returns the admission token tagging this run's claim. Deliberate
    /// owner-level serialization: no fairness is promised between waiters
    /// for the same owner.
    async fn admit(&self, owner: &str) -> u64 {
        loop {
            {
                let mut live = self.live.lock().await;
                if !live.contains_key(owner) {
                    let token = self.admissions.fetch_add(1, Ordering::SeqCst);
                    live.insert(owner.to_string(), SandboxSlot::Admitting(token));
                    return token;
                }
            }
            time::sleep(*self.config.get_admission_poll_interval()).await;
        }
    }

    /// Acquires resources in order and runs the task.
    ///
    /// Each resource is recorded in `resources` the moment it exists, so the
    /// caller's retirement block can release exactly what was acquired no
    /// matter where this returns.
    #[allow(clippy::too_many_arguments)]
    async fn provision_and_execute(
        &self,
        owner: &str,
        token: u64,
        task: &str,
        mounts: &[Mount],
        credential_dir: Option<&Path>,
        timeout: Option<Duration>,
        resources: &mut SandboxResources,
    ) -> WarrenResult<(String, i32, Vec<String>)> {
        // This layer has no privileged callers; privilege is an input of the
        // external validator, not something the orchestrator grants.
        let approved = self.policy.validate(mounts, owner, false).await?;

        let identity = self.allocator.allocate()?;
        let sandbox_id = *identity.get_sandbox_id();
        let ip = *identity.get_ip();
        tracing::info!("allocated sandbox {} at {} for owner {}", sandbox_id, ip, owner);

        let device = self.devices.create_device(sandbox_id).await?;
        resources.device = Some(device.clone());

        let disk = self
            .stager
            .stage(sandbox_id, ip, credential_dir, &approved)
            .await?;
        resources.disk_image = Some(disk.clone());

        let booted = self.hypervisor.boot(sandbox_id, &disk, &device, ip).await?;
        resources.control_socket = Some(booted.control_socket_path.clone());
        let pid = booted.child.id();
        resources.child = Some(booted.child);

        {
            let mut live = self.live.lock().await;
            live.insert(
                owner.to_string(),
                SandboxSlot::Running(token, LiveSandbox {
                    sandbox_id,
                    ip,
                    device_name: device,
                    disk_image_path: disk,
                    control_socket_path: booted.control_socket_path,
                    pid,
                    started_at: Utc::now(),
                }),
            );
        }

        self.executor.await_ready(ip).await?;

        let budget = timeout.unwrap_or(*self.config.get_exec_timeout());
        let outcome = self.executor.execute(sandbox_id, ip, task, budget).await?;

        let files_changed = self.executor.collect_changed_paths(ip).await;
        self.executor.write_back(ip, &approved).await;

        Ok((outcome.stdout, outcome.exit_code, files_changed))
    }

    /// Retirement block: releases resources, then frees the owner slot.
    ///
    /// Runs on every exit path of `run_task`. Never raises; sub-step
    /// failures are logged inside the release and the remaining steps run.
    /// The slot is removed only while it still carries this run's token: a
    /// force-teardown may have freed the owner mid-run and handed the slot
    /// to a successor, which must keep its claim.
    async fn retire(&self, owner: &str, token: u64, mut resources: SandboxResources) {
        resources.release(self.devices.as_ref()).await;

        {
            let mut live = self.live.lock().await;
            match live.get(owner) {
                Some(SandboxSlot::Admitting(t)) | Some(SandboxSlot::Running(t, _))
                    if *t == token =>
                {
                    live.remove(owner);
                }
                _ => {}
            }
        }

        tracing::info!("sandbox for owner {} retired", owner);
    }

    /// Releases the resources recorded in a registry entry.
    async fn release_live(&self, sandbox: LiveSandbox) {
        let mut resources = SandboxResources {
            child: None,
            pid: sandbox.pid,
            device: Some(sandbox.device_name),
            disk_image: Some(sandbox.disk_image_path),
            control_socket: Some(sandbox.control_socket_path),
        };
        resources.release(self.devices.as_ref()).await;
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orchestrator_error_result_shape() {
        let err = WarrenError::ExecutionTimeout {
            limit: Duration::from_secs(5),
        };
        let result = TaskResult::from_error(&err, 5000);

        assert_eq!(*result.get_exit_code(), 124);
        assert!(result.get_output().starts_with("error: "));
        assert!(!result.is_success());

        let err = WarrenError::BootFailed("no kernel".to_string());
        let result = TaskResult::from_error(&err, 10);
        assert_eq!(*result.get_exit_code(), 1);
        assert!(result.get_output().contains("no kernel"));
    }
}
