//! Workload runtime interface and mock implementation.
//!
//! The runtime abstracts everything that touches the host:
//! - Preparing an instance (image pull, root disk, boot payload)
//! - Starting, signalling and waiting on the workload
//! - Releasing per-boot and per-instance resources
//!
//! A mock implementation is provided for testing and development.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::InstanceId;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::instance::Instance;

/// Preparation failure, classified by whether retrying can help.
#[derive(Debug, Error)]
pub enum PrepareError {
    /// Retrying with the same input cannot succeed (missing image, bad config).
    #[error("{0:#}")]
    Fatal(anyhow::Error),

    #[error("{0:#}")]
    Transient(anyhow::Error),
}

impl PrepareError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Signal used to stop a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopSignal {
    #[default]
    Term,
    Int,
    Kill,
}

impl StopSignal {
    pub fn number(&self) -> i32 {
        match self {
            Self::Int => 2,
            Self::Kill => 9,
            Self::Term => 15,
        }
    }
}

/// How a workload run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitResult {
    pub exit_code: i32,
    pub exited_at: DateTime<Utc>,
}

impl ExitResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Output of a command run inside a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// One line of workload console output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub instance_id: InstanceId,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

/// Workload runtime interface.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Make the instance bootable.
    async fn prepare_instance(&self, instance: &Instance) -> Result<(), PrepareError>;

    /// Boot the workload. Returns once it is running or has failed to start.
    async fn start_vm(&self, instance: &Instance) -> Result<()>;

    /// Deliver `signal`, escalating to a kill once `timeout` passes.
    async fn stop_vm(&self, id: InstanceId, signal: StopSignal, timeout: Duration) -> Result<()>;

    /// Block until the workload exits.
    async fn wait_vm(&self, id: InstanceId) -> Result<ExitResult>;

    /// Release resources held by one boot.
    async fn destroy_vm(&self, id: InstanceId) -> Result<()>;

    /// Release everything prepared for the instance.
    async fn destroy_instance(&self, instance: &Instance) -> Result<()>;

    /// Whether a workload from before an agent restart is still alive. When
    /// it is, later `wait_vm` calls must observe its exit.
    async fn recover_vm(&self, instance: &Instance) -> bool;

    async fn exec(&self, id: InstanceId, cmd: &[String], timeout: Duration) -> Result<ExecResult>;

    fn subscribe_logs(&self, id: InstanceId) -> Result<broadcast::Receiver<LogLine>>;
}

/// Scripted preparation outcome for [`MockRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockPrepare {
    Succeed,
    FailFatal,
    FailTransient,
}

#[derive(Default)]
struct MockState {
    vms: HashMap<InstanceId, watch::Sender<Option<ExitResult>>>,
    logs: HashMap<InstanceId, broadcast::Sender<LogLine>>,
    prepare_script: VecDeque<MockPrepare>,
    prepare_default: Option<MockPrepare>,
}

/// Mock runtime for testing and development.
///
/// Workloads run until [`MockRuntime::exit_vm`] or `stop_vm` ends them.
pub struct MockRuntime {
    state: Mutex<MockState>,
    fail_starts: AtomicBool,
    recover_alive: AtomicBool,
    ignore_stops: AtomicBool,
    start_delay: Mutex<Duration>,
    prepare_calls: AtomicU32,
    start_calls: AtomicU32,
    stop_calls: AtomicU32,
    destroy_vm_calls: AtomicU32,
    destroy_instance_calls: AtomicU32,
}

impl MockRuntime {
    /// Create a mock runtime where every operation succeeds.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            fail_starts: AtomicBool::new(false),
            recover_alive: AtomicBool::new(false),
            ignore_stops: AtomicBool::new(false),
            start_delay: Mutex::new(Duration::ZERO),
            prepare_calls: AtomicU32::new(0),
            start_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
            destroy_vm_calls: AtomicU32::new(0),
            destroy_instance_calls: AtomicU32::new(0),
        }
    }

    /// Create a mock runtime that fails all starts.
    pub fn failing() -> Self {
        let runtime = Self::new();
        runtime.set_fail_starts(true);
        runtime
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue outcomes for the next preparation attempts, in order.
    pub fn script_prepare(&self, outcomes: impl IntoIterator<Item = MockPrepare>) {
        self.state().prepare_script.extend(outcomes);
    }

    /// Outcome once the script is exhausted.
    pub fn set_prepare_default(&self, outcome: MockPrepare) {
        self.state().prepare_default = Some(outcome);
    }

    pub fn set_fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    pub fn set_recover_alive(&self, alive: bool) {
        self.recover_alive.store(alive, Ordering::SeqCst);
    }

    /// Stop signals are counted but leave the workload running.
    pub fn set_ignore_stops(&self, ignore: bool) {
        self.ignore_stops.store(ignore, Ordering::SeqCst);
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Make a running workload exit with `exit_code`.
    pub fn exit_vm(&self, id: InstanceId, exit_code: i32) -> bool {
        let state = self.state();
        match state.vms.get(&id) {
            Some(vm) if vm.borrow().is_none() => {
                vm.send_replace(Some(ExitResult {
                    exit_code,
                    exited_at: Utc::now(),
                }));
                true
            }
            _ => false,
        }
    }

    /// Whether a workload is currently running.
    pub fn is_alive(&self, id: InstanceId) -> bool {
        self.state()
            .vms
            .get(&id)
            .is_some_and(|vm| vm.borrow().is_none())
    }

    /// Publish a console line for the instance.
    pub fn emit_log(&self, id: InstanceId, line: &str) {
        let sender = self.log_sender(id);
        // No subscribers is fine.
        let _ = sender.send(LogLine {
            instance_id: id,
            line: line.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn log_sender(&self, id: InstanceId) -> broadcast::Sender<LogLine> {
        self.state()
            .logs
            .entry(id)
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    fn register_vm(&self, id: InstanceId) {
        let (tx, _rx) = watch::channel(None);
        self.state().vms.insert(id, tx);
    }

    pub fn prepare_calls(&self) -> u32 {
        self.prepare_calls.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_vm_calls(&self) -> u32 {
        self.destroy_vm_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_instance_calls(&self) -> u32 {
        self.destroy_instance_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn prepare_instance(&self, instance: &Instance) -> Result<(), PrepareError> {
        self.prepare_calls.fetch_add(1, Ordering::SeqCst);

        let outcome = {
            let mut state = self.state();
            state
                .prepare_script
                .pop_front()
                .or(state.prepare_default)
                .unwrap_or(MockPrepare::Succeed)
        };

        info!(
            instance_id = %instance.id,
            image = %instance.config.image,
            outcome = ?outcome,
            "[MOCK] Preparing instance"
        );

        match outcome {
            MockPrepare::Succeed => Ok(()),
            MockPrepare::FailFatal => Err(PrepareError::Fatal(anyhow::anyhow!(
                "image {} not found",
                instance.config.image
            ))),
            MockPrepare::FailTransient => Err(PrepareError::Transient(anyhow::anyhow!(
                "registry unavailable"
            ))),
        }
    }

    async fn start_vm(&self, instance: &Instance) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_starts.load(Ordering::SeqCst) {
            anyhow::bail!("Mock runtime configured to fail");
        }

        info!(
            instance_id = %instance.id,
            cpus = instance.config.guest.cpus,
            memory_mb = instance.config.guest.memory_mb,
            "[MOCK] Starting VM"
        );

        let delay = *self.start_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.register_vm(instance.id);
        debug!(instance_id = %instance.id, "[MOCK] VM started");
        Ok(())
    }

    async fn stop_vm(&self, id: InstanceId, signal: StopSignal, timeout: Duration) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        info!(
            instance_id = %id,
            signal = ?signal,
            timeout_ms = timeout.as_millis() as u64,
            "[MOCK] Stopping VM"
        );

        if self.ignore_stops.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !self.exit_vm(id, 128 + signal.number()) && !self.state().vms.contains_key(&id) {
            anyhow::bail!("no VM for instance {id}");
        }
        Ok(())
    }

    async fn wait_vm(&self, id: InstanceId) -> Result<ExitResult> {
        let mut rx = match self.state().vms.get(&id) {
            Some(vm) => vm.subscribe(),
            None => anyhow::bail!("no VM for instance {id}"),
        };

        let exit = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| anyhow::anyhow!("VM for instance {id} vanished"))?
            .clone();

        exit.ok_or_else(|| anyhow::anyhow!("VM for instance {id} has no exit result"))
    }

    async fn destroy_vm(&self, id: InstanceId) -> Result<()> {
        self.destroy_vm_calls.fetch_add(1, Ordering::SeqCst);
        debug!(instance_id = %id, "[MOCK] Releasing VM");
        self.state().vms.remove(&id);
        Ok(())
    }

    async fn destroy_instance(&self, instance: &Instance) -> Result<()> {
        self.destroy_instance_calls.fetch_add(1, Ordering::SeqCst);
        debug!(instance_id = %instance.id, "[MOCK] Destroying instance");
        let mut state = self.state();
        state.vms.remove(&instance.id);
        state.logs.remove(&instance.id);
        Ok(())
    }

    async fn recover_vm(&self, instance: &Instance) -> bool {
        let alive = self.recover_alive.load(Ordering::SeqCst);
        if alive && !self.state().vms.contains_key(&instance.id) {
            self.register_vm(instance.id);
        }
        debug!(instance_id = %instance.id, alive, "[MOCK] Recovering VM");
        alive
    }

    async fn exec(&self, id: InstanceId, cmd: &[String], _timeout: Duration) -> Result<ExecResult> {
        if !self.is_alive(id) {
            anyhow::bail!("instance {id} is not running");
        }
        Ok(ExecResult {
            exit_code: 0,
            stdout: format!("{}\n", cmd.join(" ")),
            stderr: String::new(),
        })
    }

    fn subscribe_logs(&self, id: InstanceId) -> Result<broadcast::Receiver<LogLine>> {
        Ok(self.log_sender(id).subscribe())
    }
}
