//! Per-instance control loop.
//!
//! The manager turns lifecycle requests into event pushes and runtime calls.
//! One async mutex per instance serializes mutating operations; status reads
//! go straight to the event log snapshot.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleet_events::{EventOrigin, ExitInfo, InstanceEventPayload, InstanceStatus};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{error, info, warn};

use super::event_log::{EventLog, InstanceView};
use super::{Instance, LifecycleContext};
use crate::config::LifecycleConfig;
use crate::error::LifecycleError;
use crate::runtime::{ExecResult, LogLine, Runtime, StopSignal};
use crate::state::StoredInstance;

/// Drives one instance through its lifecycle.
pub struct Manager {
    log: EventLog,
    runtime: Arc<dyn Runtime>,
    config: LifecycleConfig,
    lock: Mutex<()>,
    prepared: AtomicBool,
    /// True while a `run` task watches a live workload.
    running: watch::Sender<bool>,
    /// The current run was asked to stop.
    stop_requested: AtomicBool,
}

impl Manager {
    /// Wraps a persisted instance. Call [`Manager::prepare`] for a new
    /// instance or [`Manager::recover`] after an agent restart.
    pub fn load(ctx: &LifecycleContext, stored: StoredInstance) -> Arc<Self> {
        let prepared = stored.instance.prepared;
        let log = EventLog::load(ctx, stored);
        let (running, _) = watch::channel(false);

        Arc::new(Self {
            log,
            runtime: Arc::clone(&ctx.runtime),
            config: ctx.config.clone(),
            lock: Mutex::new(()),
            prepared: AtomicBool::new(prepared),
            running,
            stop_requested: AtomicBool::new(false),
        })
    }

    pub fn instance(&self) -> Instance {
        self.log.instance()
    }

    pub fn status(&self) -> InstanceStatus {
        self.log.status()
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Snapshot stream, updated after every event.
    pub fn subscribe(&self) -> watch::Receiver<InstanceView> {
        self.log.subscribe()
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    /// Prepares the instance, retrying transient failures.
    ///
    /// Resumes the attempt counter from the last recorded `prepare` event.
    /// On success, starts the workload in the background when the desired
    /// status is `running`. When preparation gives up the instance is
    /// destroyed and `PreparationAbandoned` is returned.
    pub async fn prepare(self: &Arc<Self>) -> Result<(), LifecycleError> {
        let _guard = self.lock.lock().await;

        let status = self.status();
        if !matches!(status, InstanceStatus::Created | InstanceStatus::Preparing) {
            return Err(LifecycleError::precondition("prepare", status));
        }

        // An earlier attempt gave up but the destroy never got recorded.
        if let Some(reason) = self.abandoned_reason() {
            warn!(instance_id = %self.instance().id, reason = %reason, "Finishing abandoned preparation");
            self.destroy_locked(EventOrigin::System, &reason, false).await?;
            return Err(LifecycleError::PreparationAbandoned { reason });
        }

        let max_retries = self.config.max_prepare_retries;
        let mut retries = self.log.last_prepare_retries()?.map_or(0, |last| last + 1);

        let reason = loop {
            if retries >= max_retries {
                break format!("maximum retries ({max_retries}) exceeded preparing instance");
            }

            self.log.push_prepare_event(retries)?;
            let instance = self.instance();

            match self.runtime.prepare_instance(&instance).await {
                Ok(()) => {
                    self.log.push_prepared_event()?;
                    self.prepared.store(true, Ordering::SeqCst);
                    info!(instance_id = %instance.id, retries, "Instance prepared");

                    if instance.state.desired_status == InstanceStatus::Running {
                        let this = Arc::clone(self);
                        tokio::spawn(async move {
                            if let Err(e) = this.start_with(EventOrigin::System, false).await {
                                warn!(instance_id = %instance.id, error = %e, "Start after prepare failed");
                            }
                        });
                    }
                    return Ok(());
                }
                Err(err) => {
                    let fatal = err.is_fatal();
                    let give_up = fatal || retries + 1 >= max_retries;
                    warn!(
                        instance_id = %instance.id,
                        retries,
                        fatal,
                        error = %err,
                        "Preparation attempt failed"
                    );
                    self.log
                        .push_preparation_failed_event(err.to_string(), fatal, give_up)?;

                    if fatal {
                        break format!("fatal error preparing instance: {err}");
                    }
                    retries += 1;
                    if !give_up {
                        tokio::time::sleep(self.config.prepare_retry_delay).await;
                    }
                }
            }
        };

        error!(instance_id = %self.instance().id, reason = %reason, "Giving up on instance preparation");
        self.destroy_locked(EventOrigin::System, &reason, false).await?;
        Err(LifecycleError::PreparationAbandoned { reason })
    }

    /// Give-up reason of a preparation that already ended in `give_up`.
    fn abandoned_reason(&self) -> Option<String> {
        if self.instance().state.desired_status != InstanceStatus::Destroying {
            return None;
        }
        let reason = match self.log.last_event().map(|event| event.payload) {
            Some(InstanceEventPayload::PreparationFailed {
                error, fatal: true, ..
            }) => format!("fatal error preparing instance: {error}"),
            _ => format!(
                "maximum retries ({}) exceeded preparing instance",
                self.config.max_prepare_retries
            ),
        };
        Some(reason)
    }

    /// Starts the workload.
    ///
    /// Returns immediately when the instance is already starting or running.
    pub async fn start(self: &Arc<Self>) -> Result<(), LifecycleError> {
        self.start_with(EventOrigin::User, false).await
    }

    async fn start_with(
        self: &Arc<Self>,
        origin: EventOrigin,
        is_restart: bool,
    ) -> Result<(), LifecycleError> {
        let _guard = match self.lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => match self.status() {
                InstanceStatus::Starting | InstanceStatus::Running => return Ok(()),
                InstanceStatus::Stopped => self.lock.lock().await,
                status => return Err(LifecycleError::precondition("start", status)),
            },
        };

        // Whoever held the lock may have moved the instance on.
        let status = self.status();
        match status {
            InstanceStatus::Starting | InstanceStatus::Running => return Ok(()),
            _ if !status.can_transition_to(InstanceStatus::Starting) => {
                return Err(LifecycleError::precondition("start", status));
            }
            _ => {}
        }

        self.stop_requested.store(false, Ordering::SeqCst);
        self.log.push_start_event(origin, is_restart)?;
        let instance = self.instance();

        if let Err(e) = self.runtime.start_vm(&instance).await {
            warn!(instance_id = %instance.id, error = %e, "Failed to start workload");
            self.log.push_start_failed_event(format!("{e:#}"))?;
            return Err(LifecycleError::Runtime(e));
        }

        self.log.push_started_event()?;
        self.running.send_replace(true);
        info!(instance_id = %instance.id, is_restart, "Workload started");

        tokio::spawn(Arc::clone(self).run());
        Ok(())
    }

    /// Watches the workload until it exits and records the exit.
    fn run(self: Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let id = self.instance().id;

            let exit = match self.runtime.wait_vm(id).await {
                Ok(exit) => exit,
                Err(e) => {
                    // Only recovery at the next agent start can reconcile this.
                    error!(instance_id = %id, error = %e, "Failed waiting for workload");
                    self.running.send_replace(false);
                    return;
                }
            };

            if let Err(e) = self.runtime.destroy_vm(id).await {
                warn!(instance_id = %id, error = %e, "Failed to release workload resources");
            }

            let info = ExitInfo {
                success: exit.success(),
                exit_code: exit.exit_code,
                requested: self.stop_requested.load(Ordering::SeqCst),
                exited_at: exit.exited_at,
            };
            info!(
                instance_id = %id,
                exit_code = info.exit_code,
                requested = info.requested,
                "Workload exited"
            );

            let recorded = self.log.push_exited_event(info.clone());
            if let Err(e) = &recorded {
                error!(instance_id = %id, error = %e, "Failed to record workload exit");
            }
            self.running.send_replace(false);

            if recorded.is_ok() && self.should_restart(&info) {
                info!(instance_id = %id, "Restarting workload per restart policy");
                if let Err(e) = self.start_with(EventOrigin::System, true).await {
                    warn!(instance_id = %id, error = %e, "Restart failed");
                }
            }
        })
    }

    fn should_restart(&self, exit: &ExitInfo) -> bool {
        let instance = self.instance();
        !exit.requested
            && instance.state.desired_status == InstanceStatus::Running
            && instance
                .config
                .restart
                .should_restart(exit.success, instance.state.restarts)
    }

    /// Records the intent to stop and signals the workload in the background.
    ///
    /// Stopping an instance that is already stopping re-sends the signal, so
    /// callers can escalate. A stopped instance is left alone.
    pub async fn stop(
        &self,
        signal: StopSignal,
        timeout: Option<Duration>,
    ) -> Result<(), LifecycleError> {
        let timeout = timeout.unwrap_or(self.config.stop_timeout);
        let id = {
            let _guard = self.lock.lock().await;
            match self.status() {
                InstanceStatus::Stopped => return Ok(()),
                InstanceStatus::Stopping => {}
                InstanceStatus::Running => {
                    self.stop_requested.store(true, Ordering::SeqCst);
                    self.log.push_stop_event(EventOrigin::User)?;
                }
                status => return Err(LifecycleError::precondition("stop", status)),
            }
            self.instance().id
        };

        let runtime = Arc::clone(&self.runtime);
        tokio::spawn(async move {
            if let Err(e) = runtime.stop_vm(id, signal, timeout).await {
                warn!(instance_id = %id, signal = ?signal, error = %e, "Failed to stop workload");
            }
        });
        Ok(())
    }

    /// Destroys the instance.
    ///
    /// A live workload is only torn down with `force`; the call then blocks
    /// until the exit has been recorded.
    pub async fn destroy(&self, force: bool) -> Result<(), LifecycleError> {
        let _guard = self.lock.lock().await;
        self.destroy_locked(EventOrigin::User, "destroy requested", force)
            .await
    }

    /// Caller holds `self.lock`.
    async fn destroy_locked(
        &self,
        origin: EventOrigin,
        reason: &str,
        force: bool,
    ) -> Result<(), LifecycleError> {
        let status = self.status();
        if status == InstanceStatus::Destroyed {
            return Ok(());
        }

        if status.has_workload() {
            if !force {
                return Err(LifecycleError::InstanceIsRunning);
            }
            self.stop_requested.store(true, Ordering::SeqCst);
            if status == InstanceStatus::Running {
                self.log.push_stop_event(origin)?;
            }

            let id = self.instance().id;
            let mut running = self.running.subscribe();
            self.runtime
                .stop_vm(id, StopSignal::Kill, self.config.stop_timeout)
                .await?;
            // The sender lives in `self`, so this only ends once `run` is done.
            let _ = running.wait_for(|running| !*running).await;
        }

        self.log.push_destroy_event(origin, reason)?;

        let instance = self.instance();
        if let Err(e) = self.runtime.destroy_instance(&instance).await {
            warn!(instance_id = %instance.id, error = %e, "Failed to clean up instance resources");
        }

        self.log.push_destroyed_event()?;
        info!(instance_id = %instance.id, reason, "Instance destroyed");
        Ok(())
    }

    /// Reconciles persisted status with the runtime after an agent restart.
    pub async fn recover(self: &Arc<Self>) -> Result<(), LifecycleError> {
        let guard = self.lock.lock().await;
        let instance = self.instance();
        self.prepared.store(instance.prepared, Ordering::SeqCst);
        let status = instance.status();

        match status {
            InstanceStatus::Created | InstanceStatus::Preparing => {
                drop(guard);
                info!(instance_id = %instance.id, status = %status, "Resuming preparation");
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = this.prepare().await {
                        warn!(instance_id = %instance.id, error = %e, "Resumed preparation failed");
                    }
                });
            }
            InstanceStatus::Destroying => {
                info!(instance_id = %instance.id, "Resuming destroy");
                self.destroy_locked(EventOrigin::System, "resuming interrupted destroy", false)
                    .await?;
            }
            InstanceStatus::Starting | InstanceStatus::Running | InstanceStatus::Stopping => {
                if self.runtime.recover_vm(&instance).await {
                    info!(instance_id = %instance.id, status = %status, "Workload still alive, resuming watch");
                    self.stop_requested
                        .store(status == InstanceStatus::Stopping, Ordering::SeqCst);
                    self.running.send_replace(true);
                    tokio::spawn(Arc::clone(self).run());
                } else if status == InstanceStatus::Starting {
                    warn!(instance_id = %instance.id, "Start was interrupted by agent restart");
                    self.log
                        .push_start_failed_event("start interrupted by agent restart".to_string())?;
                } else {
                    warn!(instance_id = %instance.id, status = %status, "Workload died while agent was down");
                    self.log.push_exited_event(ExitInfo {
                        success: false,
                        exit_code: -1,
                        requested: false,
                        exited_at: chrono::Utc::now(),
                    })?;
                }
            }
            InstanceStatus::Stopped | InstanceStatus::Destroyed => {}
        }

        Ok(())
    }

    /// Runs a command inside the running workload.
    pub async fn exec(&self, cmd: &[String], timeout: Duration) -> Result<ExecResult, LifecycleError> {
        let id = self.require_running("exec")?;
        Ok(self.runtime.exec(id, cmd, timeout).await?)
    }

    /// Waits for the current run to end.
    pub async fn wait(&self, timeout: Duration) -> Result<(), LifecycleError> {
        let status = self.status();
        if !matches!(status, InstanceStatus::Running | InstanceStatus::Stopping) {
            return Err(LifecycleError::precondition("wait on", status));
        }

        let mut running = self.running.subscribe();
        let exited = tokio::time::timeout(timeout, running.wait_for(|running| !*running))
            .await
            .is_ok();
        if exited {
            Ok(())
        } else {
            Err(LifecycleError::DeadlineExceeded)
        }
    }

    /// Streams console output of the running workload.
    pub fn subscribe_logs(&self) -> Result<broadcast::Receiver<LogLine>, LifecycleError> {
        let id = self.require_running("read logs of")?;
        Ok(self.runtime.subscribe_logs(id)?)
    }

    fn require_running(&self, op: &str) -> Result<fleet_id::InstanceId, LifecycleError> {
        let instance = self.instance();
        if instance.status() != InstanceStatus::Running {
            return Err(LifecycleError::precondition(op, instance.status()));
        }
        Ok(instance.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockPrepare, MockRuntime};
    use crate::testing::{create_stored, test_context, wait_until, RecordingBus};
    use rstest::rstest;

    fn setup(start: bool) -> (Arc<Manager>, Arc<MockRuntime>) {
        let runtime = Arc::new(MockRuntime::new());
        let ctx = test_context(runtime.clone(), Arc::new(RecordingBus::default()));
        let stored = create_stored(&ctx, start);
        (Manager::load(&ctx, stored), runtime)
    }

    async fn running_manager() -> (Arc<Manager>, Arc<MockRuntime>) {
        let (manager, runtime) = setup(false);
        manager.prepare().await.unwrap();
        manager.start().await.unwrap();
        assert_eq!(manager.status(), InstanceStatus::Running);
        (manager, runtime)
    }

    #[tokio::test]
    async fn test_prepare_without_start_intent_stays_stopped() {
        let (manager, runtime) = setup(false);
        manager.prepare().await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.status(), InstanceStatus::Stopped);
        assert!(manager.is_prepared());
        assert_eq!(runtime.start_calls(), 0);
    }

    #[tokio::test]
    async fn test_prepare_with_start_intent_starts() {
        let (manager, runtime) = setup(true);
        manager.prepare().await.unwrap();

        wait_until(|| manager.status() == InstanceStatus::Running).await;
        assert_eq!(runtime.start_calls(), 1);
        assert!(manager.is_running());
    }

    #[tokio::test]
    async fn test_transient_then_success_keeps_start_intent() {
        let (manager, runtime) = setup(true);
        runtime.script_prepare([MockPrepare::FailTransient]);

        manager.prepare().await.unwrap();
        assert_eq!(runtime.prepare_calls(), 2);
        wait_until(|| manager.status() == InstanceStatus::Running).await;
    }

    #[tokio::test]
    async fn test_fatal_prepare_destroys_immediately() {
        let (manager, runtime) = setup(true);
        runtime.set_prepare_default(MockPrepare::FailFatal);

        let err = manager.prepare().await.unwrap_err();
        match err {
            LifecycleError::PreparationAbandoned { reason } => {
                assert!(reason.contains("fatal"), "{reason}")
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(runtime.prepare_calls(), 1);
        assert_eq!(manager.status(), InstanceStatus::Destroyed);
        assert_eq!(runtime.destroy_instance_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_start_records_start_failed() {
        let (manager, runtime) = setup(false);
        manager.prepare().await.unwrap();
        runtime.set_fail_starts(true);

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Runtime(_)));
        assert_eq!(manager.status(), InstanceStatus::Stopped);
        assert!(!manager.is_running());
    }

    #[rstest]
    #[case::created(false)]
    #[case::destroyed(true)]
    #[tokio::test]
    async fn test_start_precondition(#[case] destroy_first: bool) {
        let (manager, _runtime) = setup(false);
        if destroy_first {
            manager.prepare().await.unwrap();
            manager.destroy(false).await.unwrap();
        }

        let err = manager.start().await.unwrap_err();
        assert!(err.is_failed_precondition(), "{err}");
        assert!(err.to_string().contains(manager.status().as_str()));
    }

    #[tokio::test]
    async fn test_stop_records_requested_exit() {
        let (manager, runtime) = running_manager().await;

        manager.stop(StopSignal::Term, None).await.unwrap();
        manager.wait(Duration::from_secs(5)).await.unwrap();
        wait_until(|| manager.status() == InstanceStatus::Stopped).await;

        let last = manager.event_log().last_event().unwrap();
        match last.payload {
            fleet_events::InstanceEventPayload::Exited(exit) => {
                assert!(exit.requested);
                assert_eq!(exit.exit_code, 143);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert_eq!(runtime.destroy_vm_calls(), 1);
        assert_eq!(manager.instance().state.desired_status, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_is_reentrant_and_noop_when_stopped() {
        let runtime = Arc::new(MockRuntime::new());
        let ctx = test_context(runtime.clone(), Arc::new(RecordingBus::default()));
        let manager = Manager::load(&ctx, create_stored(&ctx, false));
        let id = manager.instance().id;
        manager.prepare().await.unwrap();
        manager.start().await.unwrap();
        runtime.set_ignore_stops(true);

        manager.stop(StopSignal::Term, None).await.unwrap();
        assert_eq!(manager.status(), InstanceStatus::Stopping);
        manager
            .stop(StopSignal::Kill, Some(Duration::from_millis(10)))
            .await
            .unwrap();
        wait_until(|| runtime.stop_calls() == 2).await;
        assert_eq!(manager.status(), InstanceStatus::Stopping);

        runtime.exit_vm(id, 137);
        wait_until(|| manager.status() == InstanceStatus::Stopped).await;
        manager.stop(StopSignal::Term, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runtime.stop_calls(), 2);

        let events = ctx.store.list_instance_events(id).unwrap();
        let stops = events
            .iter()
            .filter(|e| e.payload == InstanceEventPayload::Stop)
            .count();
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn test_stop_before_prepare_is_precondition() {
        let (manager, _runtime) = setup(false);
        let err = manager.stop(StopSignal::Term, None).await.unwrap_err();
        assert!(err.is_failed_precondition());
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let (manager, _runtime) = running_manager().await;
        let err = manager.wait(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, LifecycleError::DeadlineExceeded));
        assert_eq!(manager.status(), InstanceStatus::Running);
    }

    #[tokio::test]
    async fn test_wait_requires_running() {
        let (manager, _runtime) = setup(false);
        let err = manager.wait(Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_failed_precondition());
    }

    #[tokio::test]
    async fn test_restart_policy_restarts_on_failure() {
        let runtime = Arc::new(MockRuntime::new());
        let ctx = test_context(runtime.clone(), Arc::new(RecordingBus::default()));
        let mut request = crate::testing::instance_request(false);
        request.config.restart = crate::instance::RestartPolicy::OnFailure { max_retries: 1 };
        let stored = crate::testing::create_stored_from(&ctx, request);
        let manager = Manager::load(&ctx, stored);

        manager.prepare().await.unwrap();
        manager.start().await.unwrap();
        let id = manager.instance().id;

        runtime.exit_vm(id, 1);
        wait_until(|| runtime.start_calls() == 2 && manager.status() == InstanceStatus::Running)
            .await;
        assert_eq!(manager.instance().state.restarts, 1);

        runtime.exit_vm(id, 1);
        wait_until(|| manager.status() == InstanceStatus::Stopped).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runtime.start_calls(), 2);
    }

    #[tokio::test]
    async fn test_exec_and_logs_need_running_instance() {
        let (manager, runtime) = setup(false);
        let cmd = vec!["uname".to_string()];
        assert!(manager
            .exec(&cmd, Duration::from_secs(1))
            .await
            .unwrap_err()
            .is_failed_precondition());
        assert!(manager.subscribe_logs().is_err());

        manager.prepare().await.unwrap();
        manager.start().await.unwrap();
        let result = manager.exec(&cmd, Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.exit_code, 0);

        let mut logs = manager.subscribe_logs().unwrap();
        runtime.emit_log(manager.instance().id, "hello");
        assert_eq!(logs.recv().await.unwrap().line, "hello");
    }

    #[tokio::test]
    async fn test_destroy_created_instance_is_precondition() {
        let (manager, _runtime) = setup(false);
        let err = manager.destroy(false).await.unwrap_err();
        assert!(err.is_failed_precondition(), "{err}");
    }
}
