//! Integration tests for the sandbox lifecycle registry.
//!
//! Every privileged host operation is substituted with a fake backend, so
//! these tests run without root, virtualization hardware or a real guest.
//! The fakes still create and delete real files for disk images and control
//! sockets, and spawn a real (harmless) subprocess for the hypervisor, so
//! teardown completeness is observable from the outside.

use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{fs, process::Command, time};
use warren::{
    config::{Mount, OrchestratorConfig},
    exec::{ExecOutcome, GuestExecutor},
    net::{device_name, NetworkDeviceManager},
    orchestrator::SandboxOrchestrator,
    policy::MountPolicy,
    stage::ImageStager,
    vmm::{BootedVm, HypervisorLauncher},
    WarrenError, WarrenResult,
};

//--------------------------------------------------------------------------------------------------
// Fakes
//--------------------------------------------------------------------------------------------------

/// Ordered record of backend calls, shared by all fakes.
#[derive(Debug, Default)]
struct EventLog(Mutex<Vec<String>>);

impl EventLog {
    fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn position(&self, event: &str) -> Option<usize> {
        self.snapshot().iter().position(|e| e == event)
    }
}

#[derive(Debug)]
struct FakeDeviceManager {
    log: Arc<EventLog>,
    fail_create: bool,
}

#[async_trait]
impl NetworkDeviceManager for FakeDeviceManager {
    async fn create_device(&self, sandbox_id: u32) -> WarrenResult<String> {
        if self.fail_create {
            return Err(WarrenError::AllocationFailed("tap refused".to_string()));
        }
        let device = device_name(sandbox_id);
        self.log.push(format!("device-create:{}", device));
        Ok(device)
    }

    async fn destroy_device(&self, device: &str) {
        self.log.push(format!("device-destroy:{}", device));
    }
}

#[derive(Debug)]
struct FakeStager {
    config: Arc<OrchestratorConfig>,
    log: Arc<EventLog>,
}

#[async_trait]
impl ImageStager for FakeStager {
    async fn stage(
        &self,
        sandbox_id: u32,
        _ip: Ipv4Addr,
        _credential_dir: Option<&Path>,
        mounts: &[Mount],
    ) -> WarrenResult<PathBuf> {
        // Mounts whose host path is missing are skipped, mirroring the
        // production stager's contract.
        for mount in mounts {
            if fs::try_exists(mount.get_host()).await.unwrap_or(false) {
                self.log.push(format!("stage-mount:{}", mount));
            }
        }

        let image = self.config.image_path(sandbox_id);
        fs::create_dir_all(self.config.images_dir()).await?;
        fs::write(&image, b"disk").await?;
        self.log.push(format!("stage:{}", sandbox_id));
        Ok(image)
    }
}

#[derive(Debug)]
struct FakeHypervisor {
    config: Arc<OrchestratorConfig>,
    log: Arc<EventLog>,
    pids: Arc<Mutex<Vec<u32>>>,
    fail_boot: bool,
}

#[async_trait]
impl HypervisorLauncher for FakeHypervisor {
    async fn boot(
        &self,
        sandbox_id: u32,
        _disk_image: &Path,
        _device: &str,
        _ip: Ipv4Addr,
    ) -> WarrenResult<BootedVm> {
        if self.fail_boot {
            return Err(WarrenError::BootFailed("control plane refused".to_string()));
        }

        let socket = self.config.socket_path(sandbox_id);
        fs::create_dir_all(self.config.sockets_dir()).await?;
        fs::write(&socket, b"").await?;

        // A real, harmless subprocess standing in for the hypervisor.
        let child = Command::new("sleep").arg("60").spawn()?;
        if let Some(pid) = child.id() {
            self.pids.lock().unwrap().push(pid);
        }

        self.log.push(format!("boot:{}", sandbox_id));
        Ok(BootedVm {
            child,
            control_socket_path: socket,
        })
    }
}

#[derive(Debug)]
struct FakeExecutor {
    log: Arc<EventLog>,
    output: String,
    exit_code: i32,
    exec_delay: Duration,
}

#[async_trait]
impl GuestExecutor for FakeExecutor {
    async fn await_ready(&self, _ip: Ipv4Addr) -> WarrenResult<()> {
        Ok(())
    }

    async fn execute(
        &self,
        sandbox_id: u32,
        _ip: Ipv4Addr,
        _task: &str,
        timeout: Duration,
    ) -> WarrenResult<ExecOutcome> {
        self.log.push(format!("exec-start:{}", sandbox_id));

        if self.exec_delay > timeout {
            time::sleep(timeout).await;
            return Err(WarrenError::ExecutionTimeout { limit: timeout });
        }

        time::sleep(self.exec_delay).await;
        self.log.push(format!("exec-end:{}", sandbox_id));
        Ok(ExecOutcome {
            stdout: self.output.clone(),
            exit_code: self.exit_code,
        })
    }

    async fn collect_changed_paths(&self, _ip: Ipv4Addr) -> Vec<String> {
        Vec::new()
    }

    async fn write_back(&self, _ip: Ipv4Addr, mounts: &[Mount]) {
        for mount in mounts.iter().filter(|mount| !mount.is_read_only()) {
            self.log.push(format!("writeback:{}", mount));
        }
    }
}

#[derive(Debug)]
struct ApproveAllPolicy;

#[async_trait]
impl MountPolicy for ApproveAllPolicy {
    async fn validate(
        &self,
        requested: &[Mount],
        _owner: &str,
        _privileged: bool,
    ) -> WarrenResult<Vec<Mount>> {
        Ok(requested.to_vec())
    }
}

//--------------------------------------------------------------------------------------------------
// Harness
//--------------------------------------------------------------------------------------------------

struct Harness {
    orchestrator: Arc<SandboxOrchestrator>,
    config: Arc<OrchestratorConfig>,
    log: Arc<EventLog>,
    pids: Arc<Mutex<Vec<u32>>>,
    _home: tempfile::TempDir,
}

struct HarnessOptions {
    subnet: &'static str,
    exec_delay: Duration,
    output: &'static str,
    exit_code: i32,
    fail_create: bool,
    fail_boot: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            subnet: "172.30.0.0/24",
            exec_delay: Duration::ZERO,
            output: "ok\n",
            exit_code: 0,
            fail_create: false,
            fail_boot: false,
        }
    }
}

fn harness(options: HarnessOptions) -> Harness {
    let home = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(
        OrchestratorConfig::builder()
            .hypervisor_path("/usr/bin/firecracker")
            .kernel_path("/vmlinux")
            .base_image_path("/base.ext4")
            .home_dir(home.path())
            .subnet(options.subnet.parse().expect("subnet"))
            .admission_poll_interval(Duration::from_millis(5))
            .build(),
    );

    let log = Arc::new(EventLog::default());
    let pids = Arc::new(Mutex::new(Vec::new()));

    let orchestrator = Arc::new(SandboxOrchestrator::with_components(
        config.clone(),
        Arc::new(FakeDeviceManager {
            log: log.clone(),
            fail_create: options.fail_create,
        }),
        Arc::new(FakeStager {
            config: config.clone(),
            log: log.clone(),
        }),
        Arc::new(FakeHypervisor {
            config: config.clone(),
            log: log.clone(),
            pids: pids.clone(),
            fail_boot: options.fail_boot,
        }),
        Arc::new(FakeExecutor {
            log: log.clone(),
            output: options.output.to_string(),
            exit_code: options.exit_code,
            exec_delay: options.exec_delay,
        }),
        Arc::new(ApproveAllPolicy),
    ));

    Harness {
        orchestrator,
        config,
        log,
        pids,
        _home: home,
    }
}

fn process_is_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_run_task_success_and_exhaustive_teardown() -> anyhow::Result<()> {
    let h = harness(HarnessOptions::default());

    let result = h
        .orchestrator
        .run_task("alice", "echo ok", &[], Some(Path::new("/creds/alice")), None)
        .await;

    assert!(result.is_success());
    assert!(result.get_output().contains("ok"));

    // Every resource class is gone after the call returns.
    assert!(!h.config.image_path(1).exists());
    assert!(!h.config.socket_path(1).exists());
    let events = h.log.snapshot();
    assert!(events.contains(&"device-destroy:wtap1".to_string()));
    for pid in h.pids.lock().unwrap().iter() {
        assert!(!process_is_alive(*pid));
    }

    assert!(h.orchestrator.list_active().await.is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_same_owner_requests_are_serialized() -> anyhow::Result<()> {
    let h = harness(HarnessOptions {
        exec_delay: Duration::from_millis(50),
        ..Default::default()
    });

    let first = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_task("alice", "sleep", &[], None, None).await })
    };
    let second = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_task("alice", "sleep", &[], None, None).await })
    };

    let (first, second) = tokio::try_join!(first, second)?;
    assert!(first.is_success());
    assert!(second.is_success());

    // The second sandbox is created only after the first fully retired.
    let create_second = h.log.position("device-create:wtap2").expect("second ran");
    let destroy_first = h.log.position("device-destroy:wtap1").expect("first retired");
    assert!(
        create_second > destroy_first,
        "second sandbox started before first retired: {:?}",
        h.log.snapshot()
    );

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_distinct_owners_run_in_parallel_with_distinct_identities() -> anyhow::Result<()> {
    let h = harness(HarnessOptions {
        exec_delay: Duration::from_millis(200),
        ..Default::default()
    });

    let started = std::time::Instant::now();
    let (a, b) = tokio::join!(
        h.orchestrator.run_task("alice", "sleep", &[], None, None),
        h.orchestrator.run_task("bob", "sleep", &[], None, None),
    );
    let elapsed = started.elapsed();

    assert!(a.is_success());
    assert!(b.is_success());

    // Two serialized 200 ms executions would take at least 400 ms.
    assert!(
        elapsed < Duration::from_millis(390),
        "owners did not run in parallel: {:?}",
        elapsed
    );

    // Pairwise distinct ids, observable through the device names.
    let events = h.log.snapshot();
    assert!(events.contains(&"device-create:wtap1".to_string()));
    assert!(events.contains(&"device-create:wtap2".to_string()));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_read_only_mount_is_excluded_from_write_back() -> anyhow::Result<()> {
    let h = harness(HarnessOptions::default());

    let source = tempfile::tempdir()?;
    let rw = Mount::new(source.path(), "/workspace");
    let ro = Mount::new_read_only(source.path(), "/reference");

    let result = h
        .orchestrator
        .run_task("alice", "touch out", &[rw.clone(), ro.clone()], None, None)
        .await;
    assert!(result.is_success());

    let events = h.log.snapshot();
    assert!(events.contains(&format!("writeback:{}", rw)));
    assert!(!events.contains(&format!("writeback:{}", ro)));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_missing_mount_host_path_does_not_fail_the_run() -> anyhow::Result<()> {
    let h = harness(HarnessOptions::default());

    let missing = Mount::new("/tmp/warren-test-definitely-missing", "/workspace");
    let result = h
        .orchestrator
        .run_task("alice", "echo ok", &[missing.clone()], None, None)
        .await;

    assert!(result.is_success());
    assert!(!missing.get_host().exists());
    assert!(!h.log.snapshot().contains(&format!("stage-mount:{}", missing)));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_execution_timeout_yields_timeout_result_and_teardown() -> anyhow::Result<()> {
    let h = harness(HarnessOptions {
        exec_delay: Duration::from_secs(5),
        ..Default::default()
    });

    let result = h
        .orchestrator
        .run_task(
            "alice",
            "sleep 600",
            &[],
            None,
            Some(Duration::from_millis(50)),
        )
        .await;

    assert_eq!(*result.get_exit_code(), 124);
    assert!(result.get_output().starts_with("error: "));

    assert!(!h.config.image_path(1).exists());
    assert!(!h.config.socket_path(1).exists());
    assert!(h.log.snapshot().contains(&"device-destroy:wtap1".to_string()));
    for pid in h.pids.lock().unwrap().iter() {
        assert!(!process_is_alive(*pid));
    }

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_boot_failure_releases_earlier_resources() -> anyhow::Result<()> {
    let h = harness(HarnessOptions {
        fail_boot: true,
        ..Default::default()
    });

    let result = h.orchestrator.run_task("alice", "echo ok", &[], None, None).await;

    assert!(!result.is_success());
    assert!(result.get_output().starts_with("error: "));
    assert!(result.get_output().contains("control plane refused"));

    // The device and staged image acquired before the boot are released.
    assert!(h.log.snapshot().contains(&"device-destroy:wtap1".to_string()));
    assert!(!h.config.image_path(1).exists());
    assert!(h.orchestrator.list_active().await.is_empty());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_device_failure_produces_error_result_without_leaks() -> anyhow::Result<()> {
    let h = harness(HarnessOptions {
        fail_create: true,
        ..Default::default()
    });

    let result = h.orchestrator.run_task("alice", "echo ok", &[], None, None).await;

    assert!(!result.is_success());
    assert!(result.get_output().contains("tap refused"));
    assert!(!h.config.image_path(1).exists());
    assert!(h.orchestrator.list_active().await.is_empty());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_capacity_exhaustion_fails_loudly() -> anyhow::Result<()> {
    // A /30 leaves room for exactly one sandbox.
    let h = harness(HarnessOptions {
        subnet: "172.30.0.0/30",
        ..Default::default()
    });

    let first = h.orchestrator.run_task("alice", "echo ok", &[], None, None).await;
    assert!(first.is_success());

    let second = h.orchestrator.run_task("bob", "echo ok", &[], None, None).await;
    assert!(!second.is_success());
    assert!(second.get_output().contains("capacity"));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_status_and_kill_while_running() -> anyhow::Result<()> {
    let h = harness(HarnessOptions {
        exec_delay: Duration::from_millis(300),
        ..Default::default()
    });

    let run = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_task("alice", "sleep", &[], None, None).await })
    };

    // Wait until the sandbox registers as running.
    let mut status = Vec::new();
    for _ in 0..100 {
        status = h.orchestrator.list_active().await;
        if !status.is_empty() {
            break;
        }
        time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(status.len(), 1);
    assert_eq!(status[0].get_owner(), "alice");
    assert_eq!(*status[0].get_sandbox_id(), 1);
    assert_eq!(*status[0].get_ip(), "172.30.0.2".parse::<Ipv4Addr>()?);

    h.orchestrator.kill_sandbox("alice").await?;
    assert!(h.orchestrator.list_active().await.is_empty());

    // Killing an owner with no sandbox is an error, not a panic.
    let err = h.orchestrator.kill_sandbox("nobody").await.unwrap_err();
    assert!(matches!(err, WarrenError::SandboxNotFound(_)));

    // The in-flight run still completes and its own teardown tolerates the
    // resources already being gone.
    let result = run.await?;
    assert!(result.is_success());
    assert!(!h.config.image_path(1).exists());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_kill_mid_run_preserves_owner_serialization() -> anyhow::Result<()> {
    let h = harness(HarnessOptions {
        exec_delay: Duration::from_millis(200),
        ..Default::default()
    });

    // First run: let it register, then force-teardown while it executes.
    let first = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_task("alice", "sleep", &[], None, None).await })
    };
    for _ in 0..100 {
        if !h.orchestrator.list_active().await.is_empty() {
            break;
        }
        time::sleep(Duration::from_millis(5)).await;
    }
    h.orchestrator.kill_sandbox("alice").await?;

    // Second run claims the freed owner while the first is still in flight.
    let second = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_task("alice", "sleep", &[], None, None).await })
    };

    // The first run's late retirement must not evict the second run's claim.
    assert!(first.await?.is_success());

    let third = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_task("alice", "sleep", &[], None, None).await })
    };
    let (second, third) = tokio::try_join!(second, third)?;
    assert!(second.is_success());
    assert!(third.is_success());

    // One live sandbox per owner throughout: the third sandbox starts only
    // after the second has finished executing.
    let start_third = h.log.position("exec-start:3").expect("third ran");
    let end_second = h.log.position("exec-end:2").expect("second finished");
    assert!(
        start_third > end_second,
        "third sandbox overlapped the second: {:?}",
        h.log.snapshot()
    );

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_run_log_artifact_is_written() -> anyhow::Result<()> {
    let h = harness(HarnessOptions::default());

    let result = h.orchestrator.run_task("alice", "echo ok", &[], None, None).await;
    assert!(result.is_success());

    let owner_dir = h.config.log_dir().join("alice");
    let mut entries = tokio::fs::read_dir(&owner_dir).await?;
    let entry = entries.next_entry().await?.expect("one run log");
    let contents = tokio::fs::read_to_string(entry.path()).await?;

    assert!(contents.contains("exit_code: 0"));
    assert!(contents.contains("ok"));

    Ok(())
}
