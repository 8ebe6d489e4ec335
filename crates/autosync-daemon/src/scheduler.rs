//! Sync scheduler
//!
//! The main loop. Each iteration:
//!
//! 1. builds and populates a sync job
//! 2. syncs if the timer says so
//! 3. (re)registers the callback
//! 4. waits for callbacks until the registration needs renewing, or just
//!    sleeps until the next timer sync when no callback could be set up
//!
//! Failed iterations are counted, alerted on once they pile up, and
//! retried after a growing backoff. Teardown always runs when the loop
//! ends, whether by a fatal error or by the shutdown signal.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use autosync_core::{format_duration, Config, ConfigError, SchedulerState, WakeDecision};

use crate::alert::Alerter;
use crate::collaborators::{SyncJob, SyncJobFactory};
use crate::error::{error_chain, DaemonError, IterationOutcome};
use crate::registrar::CallbackRegistrar;
use crate::validator::IpValidator;

/// Current instant on the tokio clock
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

pub struct SyncScheduler {
    config: Arc<Config>,
    factory: Box<dyn SyncJobFactory>,
    registrar: CallbackRegistrar,
    alerter: Box<dyn Alerter>,
    validator: IpValidator,
    state: SchedulerState,
}

impl SyncScheduler {
    pub fn new(
        config: Arc<Config>,
        factory: Box<dyn SyncJobFactory>,
        registrar: CallbackRegistrar,
        alerter: Box<dyn Alerter>,
    ) -> Result<Self, ConfigError> {
        let validator = IpValidator::from_config(&config)?;
        Ok(Self {
            config,
            factory,
            registrar,
            alerter,
            validator,
            state: SchedulerState::new(now()),
        })
    }

    /// Run until `shutdown` completes or a fatal error occurs
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()>,
    {
        let result = tokio::select! {
            result = self.run_loop() => result,
            _ = shutdown => {
                info!("Shutdown requested");
                Ok(())
            }
        };
        self.registrar.teardown().await;
        result
    }

    async fn run_loop(&mut self) -> Result<(), DaemonError> {
        loop {
            match IterationOutcome::from(self.run_iteration().await) {
                IterationOutcome::Ok => self.state.record_success(),
                IterationOutcome::Recoverable(e) => self.handle_failure(e).await,
                IterationOutcome::Fatal(e) => {
                    error!("Fatal error, stopping: {}", error_chain(&e));
                    return Err(e);
                }
            }
        }
    }

    async fn run_iteration(&mut self) -> Result<(), DaemonError> {
        let mut job = self.factory.build();
        job.populate().await.map_err(DaemonError::Sync)?;

        if self.state.sync_due(now()) {
            info!("Synchronizing at start or before refresh...");
            synchronize(job.as_mut()).await?;
            self.state.record_sync(now(), self.config.wait_duration());
        }

        let registration = self.registrar.setup(&job.user_ids()).await?;
        if registration.is_some() && self.registrar.listener().is_some() {
            self.wait_for_callback(job.as_mut()).await
        } else {
            let left = self.state.until_sync(now());
            warn!("No callback, waiting for {}...", format_duration(left));
            tokio::time::sleep(left).await;
            Ok(())
        }
    }

    /// Serve callbacks until the registration is due for renewal
    async fn wait_for_callback(&mut self, job: &mut dyn SyncJob) -> Result<(), DaemonError> {
        let interval = self.config.interval_duration();
        self.state
            .begin_wait(now(), interval, self.config.refresh_duration());

        loop {
            let timeout = self.state.wait_timeout(now());
            info!("Waiting for callback for {}...", format_duration(timeout));

            let Some(listener) = self.registrar.listener() else {
                return Ok(());
            };
            let signal = listener
                .next_signal(timeout, &self.config.callback_marker, &self.validator)
                .await?;
            let triggered = signal.as_ref().is_some_and(|s| s.is_trigger());

            match self.state.after_wake(now(), triggered) {
                WakeDecision::Refresh => return Ok(()),
                WakeDecision::Sync => {
                    info!("Synchronizing...");
                    synchronize(job).await?;
                    self.state.record_sync(now(), interval);
                }
                WakeDecision::Deferred { until } => {
                    debug!(
                        "Last sync too recent, next sync in {}",
                        format_duration(until.saturating_duration_since(now()))
                    );
                }
                WakeDecision::Idle => {}
            }
        }
    }

    async fn handle_failure(&mut self, err: DaemonError) {
        let short = format!("Autosync error: {}", err);
        let descr = error_chain(&err);
        error!("{}", descr);

        let action = self.state.record_failure(self.config.mail_after_errors);
        if action.alert {
            if let Err(e) = self.alerter.send(&short, &descr).await {
                error!("Error sending email: {}", e);
            }
        } else {
            info!("No mail until {} errors", self.config.mail_after_errors);
        }

        error!(
            "Failed {} times, waiting {} seconds for retry.",
            action.consecutive_errors,
            action.backoff.as_secs()
        );
        tokio::time::sleep(action.backoff).await;
    }
}

async fn synchronize(job: &mut dyn SyncJob) -> Result<(), DaemonError> {
    info!("Starting sync at {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
    job.synchronize().await.map_err(DaemonError::Sync)?;
    info!("Finished sync at {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::alert::AlertError;
    use crate::collaborators::CollaboratorError;
    use crate::portmap::tests::MockGateway;
    use crate::registrar::tests::{registrar, RecordingApi};
    use crate::resolver::tests::FixedProbe;

    #[derive(Clone, Default)]
    struct Jobs {
        syncs: Arc<AtomicU32>,
        fail: Arc<AtomicBool>,
        users: Vec<String>,
    }

    struct MockJob(Jobs);

    #[async_trait::async_trait]
    impl SyncJob for MockJob {
        async fn populate(&mut self) -> Result<(), CollaboratorError> {
            Ok(())
        }

        async fn synchronize(&mut self) -> Result<(), CollaboratorError> {
            self.0.syncs.fetch_add(1, Ordering::SeqCst);
            if self.0.fail.load(Ordering::SeqCst) {
                return Err(CollaboratorError::Other("budget unreachable".into()));
            }
            Ok(())
        }

        fn user_ids(&self) -> Vec<String> {
            self.0.users.clone()
        }
    }

    impl SyncJobFactory for Jobs {
        fn build(&self) -> Box<dyn SyncJob> {
            Box::new(MockJob(self.clone()))
        }
    }

    #[derive(Clone, Default)]
    struct MockAlerter {
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl Alerter for MockAlerter {
        async fn send(&self, subject: &str, _body: &str) -> Result<(), AlertError> {
            self.sent.lock().unwrap().push(subject.to_string());
            Ok(())
        }
    }

    fn scheduler(
        config: Config,
        probe: FixedProbe,
        jobs: &Jobs,
        alerter: &MockAlerter,
        api: &RecordingApi,
    ) -> SyncScheduler {
        let reg = registrar(
            config.clone(),
            probe,
            MockGateway {
                fail_discovery: true,
                ..MockGateway::default()
            },
            api.clone(),
        );
        SyncScheduler::new(
            Arc::new(config),
            Box::new(jobs.clone()),
            reg,
            Box::new(alerter.clone()),
        )
        .unwrap()
    }

    const HOUR: Duration = Duration::from_secs(3600);

    fn free_port() -> u16 {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    }

    /// Deliver one callback from loopback
    async fn trigger(port: u16) {
        let mut stream = tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .await
            .unwrap();
        stream
            .write_all(b"POST /bunq2ynab-autosync HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert!(reply.starts_with(b"HTTP/1.1 200 OK"));
    }

    /// Scheduler whose last sync was a minute ago, listening on `port`
    fn synced_a_minute_ago(port: u16, jobs: &Jobs, api: &RecordingApi) -> SyncScheduler {
        let config = Config {
            port: Some(port),
            ..Config::default()
        };
        let mut sched = scheduler(
            config,
            FixedProbe::new("81.2.69.161", None),
            jobs,
            &MockAlerter::default(),
            api,
        );
        let minute_ago = now().checked_sub(Duration::from_secs(60)).unwrap();
        sched.state.record_sync(minute_ago, HOUR);
        sched
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_only_syncs_every_wait() {
        let jobs = Jobs::default();
        let alerter = MockAlerter::default();
        let sched = scheduler(
            Config::default(),
            FixedProbe::new("192.168.1.2", None),
            &jobs,
            &alerter,
            &RecordingApi::default(),
        );

        sched
            .run(tokio::time::sleep(3 * HOUR + Duration::from_secs(60)))
            .await
            .unwrap();

        // t = 0, 1h, 2h, 3h
        assert_eq!(jobs.syncs.load(Ordering::SeqCst), 4);
        assert!(alerter.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_escalate_to_alerts() {
        let jobs = Jobs {
            fail: Arc::new(AtomicBool::new(true)),
            ..Jobs::default()
        };
        let alerter = MockAlerter::default();
        let sched = scheduler(
            Config::default(),
            FixedProbe::new("192.168.1.2", None),
            &jobs,
            &alerter,
            &RecordingApi::default(),
        );

        // Failures at 0, 60, 120, 420, 720 and 1020 seconds
        sched
            .run(tokio::time::sleep(Duration::from_secs(1100)))
            .await
            .unwrap();

        assert_eq!(jobs.syncs.load(Ordering::SeqCst), 6);
        let sent = alerter.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("budget unreachable"));
    }

    #[tokio::test]
    async fn test_early_callback_is_debounced_and_cleaned_up() {
        let port = free_port();
        let jobs = Jobs {
            users: vec!["1001".into()],
            ..Jobs::default()
        };
        let api = RecordingApi::default();
        let config = Config {
            port: Some(port),
            ..Config::default()
        };
        let sched = scheduler(
            config,
            FixedProbe::new("81.2.69.161", None),
            &jobs,
            &MockAlerter::default(),
            &api,
        );

        let caller = async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let mut stream = tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port))
                .await
                .unwrap();
            stream
                .write_all(b"POST /bunq2ynab-autosync HTTP/1.1\r\n\r\n")
                .await
                .unwrap();
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).await.unwrap();
            assert!(reply.starts_with(b"HTTP/1.1 200 OK"));
            tokio::time::sleep(Duration::from_millis(100)).await;
        };
        sched.run(caller).await.unwrap();

        // The startup sync ran; the callback 300ms later was debounced
        assert_eq!(jobs.syncs.load(Ordering::SeqCst), 1);
        assert_eq!(
            api.calls(),
            vec![
                format!(
                    "add 1001 bunq2ynab-autosync https://81.2.69.161:{}/bunq2ynab-autosync",
                    port
                ),
                "remove 1001 bunq2ynab-autosync".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_callback_after_debounce_runs_sync() {
        let port = free_port();
        let jobs = Jobs {
            users: vec!["1001".into()],
            ..Jobs::default()
        };
        let api = RecordingApi::default();
        let sched = synced_a_minute_ago(port, &jobs, &api);

        let caller = async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger(port).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        };
        sched.run(caller).await.unwrap();

        // No startup sync was due; the callback alone caused this one
        assert_eq!(jobs.syncs.load(Ordering::SeqCst), 1);
        assert_eq!(api.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_triggered_sync_is_retried() {
        let port = free_port();
        let jobs = Jobs {
            fail: Arc::new(AtomicBool::new(true)),
            ..Jobs::default()
        };
        let api = RecordingApi::default();
        let mut sched = synced_a_minute_ago(port, &jobs, &api);

        let (result, _) = tokio::join!(sched.run_iteration(), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger(port).await;
        });
        assert!(matches!(result, Err(DaemonError::Sync(_))));
        assert_eq!(jobs.syncs.load(Ordering::SeqCst), 1);
        assert!(sched.state.sync_due(now()));

        // The next iteration syncs straight away, without another callback
        jobs.fail.store(false, Ordering::SeqCst);
        tokio::select! {
            _ = sched.run_iteration() => {}
            _ = tokio::time::sleep(Duration::from_millis(300)) => {}
        }
        assert_eq!(jobs.syncs.load(Ordering::SeqCst), 2);
        assert!(!sched.state.sync_due(now()));

        sched.registrar.teardown().await;
    }
}
