#[cfg(test)]
mod tests {
    use crate::config::{Config, OrchestratorSettings};
    use crate::error::{OrchestratorError, Result};
    use crate::events::{Event, EventKind, EventQuery, Severity};
    use crate::orchestrator::Orchestrator;
    use crate::units::metrics::{calculate_cpu_percent, parse_stat_cpu_ticks, parse_status_rss_kb};
    use crate::units::{
        BackoffStrategy, Decision, ExitInfo, FailureWindow, FlappingPolicy, HealthCheckSpec,
        HealthProbe, HealthStatus, JitterMode, LimitLevel, Metric, MockResourceSampler,
        ProbeOutcome, ProcessBackend, ProcessHandle, RawUsage, Registry, RemediationEngine,
        RemediationTrigger, ResourceLimits, ResourceSampler, RestartPolicy, StopSignal,
        UnitDefinition, UnitStatus,
    };
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::watch;
    use tokio::time::{sleep, Instant};

    const MB: u64 = 1024 * 1024;

    // ---- Fake process backend ----

    #[derive(Debug, Clone, Copy)]
    enum Script {
        RunForever,
        ExitAfter(Duration, i32),
        SpawnError,
    }

    struct FakeProc {
        unit: String,
        alive: bool,
        ignore_term: bool,
        exit_tx: watch::Sender<Option<ExitInfo>>,
    }

    #[derive(Default)]
    struct FakeState {
        scripts: HashMap<String, VecDeque<Script>>,
        defaults: HashMap<String, Script>,
        ignore_term: HashSet<String>,
        spawns: Vec<(String, Instant)>,
        signals: Vec<(String, StopSignal)>,
        procs: HashMap<u32, FakeProc>,
        next_pid: u32,
    }

    /// Scripted processes: each spawn consumes the unit's next script
    #[derive(Clone, Default)]
    struct FakeBackend {
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeBackend {
        fn new() -> Self {
            let backend = Self::default();
            backend.state.lock().unwrap().next_pid = 1000;
            backend
        }

        fn script(&self, unit: &str, scripts: impl IntoIterator<Item = Script>) {
            self.state
                .lock()
                .unwrap()
                .scripts
                .entry(unit.to_string())
                .or_default()
                .extend(scripts);
        }

        fn default_script(&self, unit: &str, script: Script) {
            self.state
                .lock()
                .unwrap()
                .defaults
                .insert(unit.to_string(), script);
        }

        fn ignore_term(&self, unit: &str) {
            self.state
                .lock()
                .unwrap()
                .ignore_term
                .insert(unit.to_string());
        }

        fn spawns(&self, unit: &str) -> Vec<Instant> {
            self.state
                .lock()
                .unwrap()
                .spawns
                .iter()
                .filter(|(u, _)| u == unit)
                .map(|(_, at)| *at)
                .collect()
        }

        fn spawn_count(&self, unit: &str) -> usize {
            self.spawns(unit).len()
        }

        fn total_spawns(&self) -> usize {
            self.state.lock().unwrap().spawns.len()
        }

        fn alive_count(&self, unit: &str) -> usize {
            self.state
                .lock()
                .unwrap()
                .procs
                .values()
                .filter(|p| p.unit == unit && p.alive)
                .count()
        }

        fn signals(&self) -> Vec<(String, StopSignal)> {
            self.state.lock().unwrap().signals.clone()
        }

        fn signals_for(&self, unit: &str) -> Vec<StopSignal> {
            self.signals()
                .into_iter()
                .filter(|(u, _)| u == unit)
                .map(|(_, s)| s)
                .collect()
        }

        /// Make the unit's live process exit with `code`
        fn crash(&self, unit: &str, code: i32) {
            let pid = {
                let state = self.state.lock().unwrap();
                state
                    .procs
                    .iter()
                    .find(|(_, p)| p.unit == unit && p.alive)
                    .map(|(pid, _)| *pid)
            };
            let pid = pid.expect("unit has no live process");
            exit_pid(&self.state, pid, ExitInfo::code(code));
        }
    }

    fn exit_pid(state: &Arc<Mutex<FakeState>>, pid: u32, exit: ExitInfo) {
        let mut state = state.lock().unwrap();
        if let Some(process) = state.procs.get_mut(&pid) {
            if process.alive {
                process.alive = false;
                process.exit_tx.send_replace(Some(exit));
            }
        }
    }

    struct FakeHandle {
        pid: u32,
        exited: watch::Receiver<Option<ExitInfo>>,
    }

    #[async_trait]
    impl ProcessHandle for FakeHandle {
        fn pid(&self) -> u32 {
            self.pid
        }

        async fn wait(&mut self) -> Result<ExitInfo> {
            let exit = *self.exited.wait_for(|e| e.is_some()).await?;
            Ok(exit.unwrap_or(ExitInfo {
                code: None,
                signal: None,
            }))
        }
    }

    #[async_trait]
    impl ProcessBackend for FakeBackend {
        async fn spawn(&self, def: &UnitDefinition) -> Result<Box<dyn ProcessHandle>> {
            let (pid, rx, script) = {
                let mut state = self.state.lock().unwrap();
                let queued = state
                    .scripts
                    .get_mut(&def.id)
                    .and_then(VecDeque::pop_front);
                let script = queued
                    .or_else(|| state.defaults.get(&def.id).copied())
                    .unwrap_or(Script::RunForever);
                state.spawns.push((def.id.clone(), Instant::now()));

                if let Script::SpawnError = script {
                    return Err(OrchestratorError::SpawnFailure {
                        unit: def.id.clone(),
                        message: format!("binary '{}' not found", def.command),
                    }
                    .into());
                }

                let pid = state.next_pid;
                state.next_pid += 1;
                let (tx, rx) = watch::channel(None);
                let ignore_term = state.ignore_term.contains(&def.id);
                state.procs.insert(
                    pid,
                    FakeProc {
                        unit: def.id.clone(),
                        alive: true,
                        ignore_term,
                        exit_tx: tx,
                    },
                );
                (pid, rx, script)
            };

            if let Script::ExitAfter(after, code) = script {
                let shared = self.state.clone();
                tokio::spawn(async move {
                    sleep(after).await;
                    exit_pid(&shared, pid, ExitInfo::code(code));
                });
            }

            Ok(Box::new(FakeHandle { pid, exited: rx }))
        }

        fn signal(&self, pid: u32, signal: StopSignal) -> Result<()> {
            let exit = {
                let mut state = self.state.lock().unwrap();
                let Some(process) = state.procs.get(&pid) else {
                    return Ok(());
                };
                let unit = process.unit.clone();
                let exit = match signal {
                    StopSignal::Terminate if process.ignore_term => None,
                    StopSignal::Terminate => Some(ExitInfo::signaled(15)),
                    StopSignal::Kill => Some(ExitInfo::signaled(9)),
                };
                state.signals.push((unit, signal));
                exit
            };

            if let Some(exit) = exit {
                exit_pid(&self.state, pid, exit);
            }
            Ok(())
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.state
                .lock()
                .unwrap()
                .procs
                .get(&pid)
                .is_some_and(|p| p.alive)
        }
    }

    // ---- Fake probe and sampler ----

    #[derive(Debug, Clone, Copy)]
    enum ProbeBehaviour {
        Healthy,
        Fail,
        Hang,
    }

    #[derive(Default)]
    struct FakeProbe {
        behaviour: Mutex<HashMap<String, ProbeBehaviour>>,
    }

    impl FakeProbe {
        fn set(&self, unit: &str, behaviour: ProbeBehaviour) {
            self.behaviour
                .lock()
                .unwrap()
                .insert(unit.to_string(), behaviour);
        }
    }

    #[async_trait]
    impl HealthProbe for FakeProbe {
        async fn probe(&self, unit: &str, _check: &HealthCheckSpec) -> ProbeOutcome {
            let behaviour = self
                .behaviour
                .lock()
                .unwrap()
                .get(unit)
                .copied()
                .unwrap_or(ProbeBehaviour::Healthy);
            match behaviour {
                ProbeBehaviour::Healthy => ProbeOutcome::Healthy,
                ProbeBehaviour::Fail => ProbeOutcome::Failed("HTTP 503 Service Unavailable".to_string()),
                ProbeBehaviour::Hang => std::future::pending().await,
            }
        }
    }

    struct IdleSampler;

    impl ResourceSampler for IdleSampler {
        fn sample(&self, _pid: u32) -> Result<RawUsage> {
            Ok(RawUsage {
                cpu_time: Duration::ZERO,
                memory_bytes: 10 * MB,
            })
        }
    }

    // ---- Harness ----

    struct Harness {
        orch: Orchestrator,
        backend: FakeBackend,
        probe: Arc<FakeProbe>,
    }

    impl Harness {
        fn status(&self, unit: &str) -> UnitStatus {
            self.orch.registry().state(unit).unwrap().status
        }

        fn events_of(&self, kind: EventKind) -> Vec<Event> {
            self.orch.events().query(&EventQuery {
                kind: Some(kind),
                ..Default::default()
            })
        }
    }

    /// Interval jobs only run their first tick; tests drive sweeps by hand
    fn quiet_settings() -> OrchestratorSettings {
        OrchestratorSettings {
            health_interval_secs: 3600,
            resource_interval_secs: 3600,
            forecast_interval_secs: 3600,
            balancer_interval_secs: 3600,
            ..OrchestratorSettings::default()
        }
    }

    fn harness_with(
        units: Vec<UnitDefinition>,
        settings: OrchestratorSettings,
        backend: FakeBackend,
        sampler: Arc<dyn ResourceSampler>,
    ) -> Harness {
        let probe = Arc::new(FakeProbe::default());
        let config = Config {
            orchestrator: settings,
            units,
        };
        let orch = Orchestrator::with_components(
            config,
            Arc::new(backend.clone()),
            probe.clone(),
            sampler,
        )
        .unwrap();
        Harness {
            orch,
            backend,
            probe,
        }
    }

    fn harness(units: Vec<UnitDefinition>, backend: FakeBackend) -> Harness {
        harness_with(units, quiet_settings(), backend, Arc::new(IdleSampler))
    }

    fn unit(id: &str) -> UnitDefinition {
        UnitDefinition::new(id, format!("/usr/bin/{}", id))
    }

    fn http_check(interval_secs: u64, timeout_secs: u64) -> HealthCheckSpec {
        HealthCheckSpec {
            url: "http://127.0.0.1:8080/health".to_string(),
            interval_secs,
            timeout_secs,
        }
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|u| u == id).unwrap()
    }

    // ---- Registry ----

    #[test]
    fn test_registry_rejects_bad_definitions() {
        let err = Registry::new(vec![unit("db"), unit("db")]).err().unwrap();
        assert!(err.to_string().contains("duplicate unit id"));

        assert!(Registry::new(vec![unit("has space")]).is_err());
        assert!(Registry::new(vec![UnitDefinition::new("x", "  ")]).is_err());
        assert!(Registry::new(vec![unit("api-v2.internal_1")]).is_ok());
    }

    #[test]
    fn test_dependency_waves_and_dependents() -> Result<()> {
        let registry = Registry::new(vec![
            unit("web").depends_on(["api"]),
            unit("api").depends_on(["db", "cache"]),
            unit("metrics"),
            unit("db"),
            unit("cache"),
        ])?;

        let waves = registry.dependency_waves()?;
        assert_eq!(
            waves,
            vec![
                vec!["metrics".to_string(), "db".to_string(), "cache".to_string()],
                vec!["api".to_string()],
                vec!["web".to_string()],
            ]
        );
        assert_eq!(registry.dependents("db"), vec!["api"]);

        let mut downstream = registry.transitive_dependents("cache");
        downstream.sort();
        assert_eq!(downstream, vec!["api", "web"]);
        Ok(())
    }

    #[test]
    fn test_cycle_names_the_units() -> Result<()> {
        let registry = Registry::new(vec![
            unit("standalone"),
            unit("a").depends_on(["c"]),
            unit("b").depends_on(["a"]),
            unit("c").depends_on(["b"]),
        ])?;

        let err = registry.dependency_waves().unwrap_err();
        match err.downcast_ref::<OrchestratorError>() {
            Some(OrchestratorError::DependencyCycle { units }) => {
                assert_eq!(units.first(), units.last());
                for id in ["a", "b", "c"] {
                    assert!(units.iter().any(|u| u == id), "cycle {:?} misses {}", units, id);
                }
                assert!(!units.iter().any(|u| u == "standalone"));
            }
            other => panic!("expected a dependency cycle, got {:?}", other),
        }
        Ok(())
    }

    // ---- Backoff and flapping policies ----

    #[test]
    fn test_exponential_backoff_caps() {
        let backoff = BackoffStrategy::default();
        let delays: Vec<u64> = (1..=7).map(|n| backoff.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);

        assert_eq!(BackoffStrategy::Immediate.delay(3), Duration::ZERO);
        assert_eq!(
            BackoffStrategy::FixedDelay(Duration::from_secs(5)).delay(9),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let delay = Duration::from_millis(1_000);
        for _ in 0..100 {
            assert!(JitterMode::Full.apply(delay) <= delay);
            let equal = JitterMode::Equal.apply(delay);
            assert!(equal >= Duration::from_millis(500) && equal <= delay);
        }
        assert_eq!(JitterMode::None.apply(delay), delay);
    }

    #[test]
    fn test_failure_window_slides() {
        let policy = FlappingPolicy::default();
        let start = Instant::now();
        let mut window = FailureWindow::default();

        for i in 0..5 {
            let count = window.record(start + Duration::from_secs(i * 10), policy.window);
            assert!(!policy.is_flapping(count));
        }
        assert!(policy.is_flapping(window.record(start + Duration::from_secs(60), policy.window)));

        // Ten minutes later only the new failure counts
        assert_eq!(window.record(start + Duration::from_secs(700), policy.window), 1);
        window.clear();
        assert!(window.is_empty());
    }

    // ---- /proc parsing ----

    #[test]
    fn test_parse_proc_files() -> Result<()> {
        let stat = "4242 (my (odd) proc) S 1 4242 4242 0 -1 4194560 1200 0 0 0 250 50 0 0 20 0 4 0 12345 104857600 2560 18446744073709551615";
        assert_eq!(parse_stat_cpu_ticks(stat)?, 300);
        assert!(parse_stat_cpu_ticks("garbage").is_err());

        let status = "Name:\tworker\nVmPeak:\t  200000 kB\nVmRSS:\t  51200 kB\nThreads:\t4\n";
        assert_eq!(parse_status_rss_kb(status)?, 51200);
        assert_eq!(parse_status_rss_kb("Name:\tkthreadd\n")?, 0);

        let pct = calculate_cpu_percent(Duration::from_secs(10), Duration::from_millis(10_500), 2.0);
        assert!((pct - 25.0).abs() < 1e-9);
        assert_eq!(calculate_cpu_percent(Duration::from_secs(10), Duration::from_secs(9), 2.0), 0.0);
        Ok(())
    }

    // ---- Lifecycle ----

    #[tokio::test(start_paused = true)]
    async fn test_start_all_follows_dependency_order() -> Result<()> {
        let backend = FakeBackend::new();
        let h = harness(
            vec![
                unit("web").depends_on(["api"]),
                unit("api").depends_on(["db", "cache"]),
                unit("metrics"),
                unit("db"),
                unit("cache"),
            ],
            backend.clone(),
        );

        let report = h.orch.start().await?;
        assert_eq!(report.started.len(), 5);
        assert!(report.failed.is_empty() && report.blocked.is_empty());

        let order = &report.order;
        assert!(position(order, "api") > position(order, "db"));
        assert!(position(order, "api") > position(order, "cache"));
        assert!(position(order, "web") > position(order, "api"));

        // Independent units start together; dependents wait out the grace period
        let db = backend.spawns("db")[0];
        assert_eq!(backend.spawns("cache")[0], db);
        assert_eq!(backend.spawns("metrics")[0], db);
        assert!(backend.spawns("api")[0] >= db + Duration::from_secs(3));
        assert!(backend.spawns("web")[0] >= backend.spawns("api")[0] + Duration::from_secs(3));

        for id in ["web", "api", "metrics", "db", "cache"] {
            assert_eq!(h.status(id), UnitStatus::Running);
            assert_eq!(h.orch.registry().state(id)?.restart_count, 0);
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_aborts_before_any_spawn() {
        let backend = FakeBackend::new();
        let h = harness(
            vec![
                unit("d"),
                unit("a").depends_on(["c"]),
                unit("b").depends_on(["a"]),
                unit("c").depends_on(["b"]),
            ],
            backend.clone(),
        );

        let err = h.orch.start().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::DependencyCycle { .. })
        ));
        assert_eq!(backend.total_spawns(), 0);

        let errors = h.events_of(EventKind::DependencyError);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].severity, Severity::Error);
        assert_eq!(h.status("d"), UnitStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_dependency_is_rejected() {
        let backend = FakeBackend::new();
        let h = harness(vec![unit("a").depends_on(["ghost"]), unit("b")], backend.clone());

        let err = h.orch.start().await.unwrap_err();
        match err.downcast_ref::<OrchestratorError>() {
            Some(OrchestratorError::UnknownDependency { unit, dependency }) => {
                assert_eq!(unit, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("expected unknown dependency, got {:?}", other),
        }
        assert_eq!(backend.total_spawns(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_dependency_blocks_chain() -> Result<()> {
        let backend = FakeBackend::new();
        backend.script("a", [Script::SpawnError]);
        let h = harness(
            vec![
                unit("a").restart(RestartPolicy::Never),
                unit("b").depends_on(["a"]),
                unit("c").depends_on(["b"]),
            ],
            backend.clone(),
        );

        let report = h.orch.start().await?;
        assert_eq!(report.failed, vec!["a"]);
        assert_eq!(report.blocked, vec!["b", "c"]);
        assert!(report.started.is_empty());

        assert_eq!(backend.spawn_count("b"), 0);
        assert_eq!(backend.spawn_count("c"), 0);
        assert_eq!(h.status("a"), UnitStatus::Failed);

        let b = h.orch.registry().state("b")?;
        assert_eq!(b.status, UnitStatus::Blocked);
        assert_eq!(b.blocked_by.as_deref(), Some("a"));
        let c = h.orch.registry().state("c")?;
        assert_eq!(c.status, UnitStatus::Blocked);
        assert_eq!(c.blocked_by.as_deref(), Some("b"));

        assert_eq!(h.events_of(EventKind::SpawnFailed).len(), 1);
        assert_eq!(h.events_of(EventKind::Blocked).len(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_during_grace_is_startup_failure() -> Result<()> {
        let backend = FakeBackend::new();
        backend.script("a", [Script::ExitAfter(Duration::from_secs(1), 2)]);
        let h = harness(vec![unit("a").restart(RestartPolicy::Never)], backend.clone());

        let report = h.orch.start().await?;
        assert_eq!(report.failed, vec!["a"]);

        let state = h.orch.registry().state("a")?;
        assert_eq!(state.status, UnitStatus::Failed);
        assert_eq!(state.last_exit_code, Some(2));
        assert_eq!(state.pid, None);

        let startup = h.events_of(EventKind::StartupExit);
        assert_eq!(startup.len(), 1);
        assert_eq!(startup[0].severity, Severity::Error);
        assert!(h.events_of(EventKind::UnexpectedExit).is_empty());
        assert!(h.events_of(EventKind::Started).is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_of_dependency_unblocks_dependents() -> Result<()> {
        let backend = FakeBackend::new();
        backend.script("a", [Script::ExitAfter(Duration::from_secs(1), 1)]);
        let h = harness(
            vec![
                unit("a").restart(RestartPolicy::Never),
                unit("b").depends_on(["a"]),
            ],
            backend.clone(),
        );

        h.orch.start().await?;
        assert_eq!(h.status("b"), UnitStatus::Blocked);

        h.orch.control().start("a").await?;
        assert_eq!(h.status("a"), UnitStatus::Running);
        assert_eq!(h.status("b"), UnitStatus::Running);
        assert_eq!(backend.spawn_count("b"), 1);
        assert_eq!(h.orch.registry().state("b")?.blocked_by, None);
        // Manual starts never count as restarts
        assert_eq!(h.orch.registry().state("a")?.restart_count, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_start_is_idempotent() -> Result<()> {
        let backend = FakeBackend::new();
        let h = harness(vec![unit("x")], backend.clone());

        h.orch.start().await?;
        let pid = h.orch.registry().state("x")?.pid;
        h.orch.control().start("x").await?;
        h.orch.control().start("x").await?;

        assert_eq!(backend.spawn_count("x"), 1);
        let state = h.orch.registry().state("x")?;
        assert_eq!(state.pid, pid);
        assert_eq!(state.restart_count, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmet_dependency_on_manual_start() -> Result<()> {
        let backend = FakeBackend::new();
        let h = harness(vec![unit("a"), unit("b").depends_on(["a"])], backend.clone());

        let err = h.orch.control().start("b").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::DependencyNotReady { .. })
        ));
        assert_eq!(h.status("b"), UnitStatus::Blocked);
        assert_eq!(backend.spawn_count("b"), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_stops_dependents_first() -> Result<()> {
        let backend = FakeBackend::new();
        let h = harness(
            vec![
                unit("a"),
                unit("b").depends_on(["a"]),
                unit("c").depends_on(["b"]),
                unit("d").depends_on(["a"]),
            ],
            backend.clone(),
        );

        h.orch.start().await?;
        h.orch.lifecycle().stop_all(false).await?;

        let order: Vec<String> = backend
            .signals()
            .into_iter()
            .filter(|(_, s)| *s == StopSignal::Terminate)
            .map(|(u, _)| u)
            .collect();
        assert_eq!(order.len(), 4);
        assert!(position(&order, "c") < position(&order, "b"));
        assert!(position(&order, "b") < position(&order, "a"));
        assert!(position(&order, "d") < position(&order, "a"));

        for id in ["a", "b", "c", "d"] {
            let state = h.orch.registry().state(id)?;
            assert_eq!(state.status, UnitStatus::Stopped);
            assert!(state.manually_stopped);
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_unit_takes_dependents_down() -> Result<()> {
        let backend = FakeBackend::new();
        let h = harness(
            vec![
                unit("a"),
                unit("b").depends_on(["a"]),
                unit("c").depends_on(["b"]),
                unit("other"),
            ],
            backend.clone(),
        );

        h.orch.start().await?;
        h.orch.control().stop("b", false).await?;

        assert_eq!(h.status("c"), UnitStatus::Stopped);
        assert_eq!(h.status("b"), UnitStatus::Stopped);
        assert_eq!(h.status("a"), UnitStatus::Running);
        assert_eq!(h.status("other"), UnitStatus::Running);
        let order: Vec<String> = backend.signals().into_iter().map(|(u, _)| u).collect();
        assert_eq!(order, vec!["c", "b"]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_escalates_to_sigkill() -> Result<()> {
        let backend = FakeBackend::new();
        backend.ignore_term("stubborn");
        let h = harness(vec![unit("stubborn").restart(RestartPolicy::Always)], backend.clone());

        h.orch.start().await?;
        let began = Instant::now();
        h.orch.control().stop("stubborn", false).await?;

        assert!(began.elapsed() >= Duration::from_secs(10));
        assert_eq!(
            backend.signals_for("stubborn"),
            vec![StopSignal::Terminate, StopSignal::Kill]
        );
        let escalations = h.events_of(EventKind::StopEscalated);
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].automated_action.as_deref(), Some("sigkill"));

        // An intentional stop is never remediated
        sleep(Duration::from_secs(60)).await;
        assert_eq!(h.status("stubborn"), UnitStatus::Stopped);
        assert_eq!(backend.spawn_count("stubborn"), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_stop_skips_sigterm() -> Result<()> {
        let backend = FakeBackend::new();
        let h = harness(vec![unit("x")], backend.clone());

        h.orch.start().await?;
        h.orch.control().stop("x", true).await?;

        assert_eq!(backend.signals_for("x"), vec![StopSignal::Kill]);
        assert_eq!(h.status("x"), UnitStatus::Stopped);
        Ok(())
    }

    // ---- Remediation ----

    #[tokio::test(start_paused = true)]
    async fn test_never_policy_stays_failed() -> Result<()> {
        let backend = FakeBackend::new();
        let h = harness(vec![unit("x").restart(RestartPolicy::Never)], backend.clone());

        h.orch.start().await?;
        backend.crash("x", 1);
        sleep(Duration::from_secs(120)).await;

        let state = h.orch.registry().state("x")?;
        assert_eq!(state.status, UnitStatus::Failed);
        assert_eq!(state.restart_count, 0);
        assert_eq!(state.last_exit_code, Some(1));
        assert_eq!(backend.spawn_count("x"), 1);
        assert_eq!(h.events_of(EventKind::UnexpectedExit).len(), 1);
        assert_eq!(h.events_of(EventKind::RemediationSkipped).len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_loop_backs_off_then_quarantines() -> Result<()> {
        let backend = FakeBackend::new();
        backend.default_script("x", Script::ExitAfter(Duration::from_secs(10), 1));
        let h = harness(vec![unit("x").restart(RestartPolicy::Always)], backend.clone());

        h.orch.start().await?;
        sleep(Duration::from_secs(600)).await;

        // Initial spawn plus five restarts; the sixth crash trips quarantine
        let spawns = backend.spawns("x");
        assert_eq!(spawns.len(), 6);
        let gaps: Vec<Duration> = spawns.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(
            gaps.windows(2).all(|g| g[1] > g[0]),
            "gaps between restarts must grow: {:?}",
            gaps
        );

        let state = h.orch.registry().state("x")?;
        assert_eq!(state.status, UnitStatus::Quarantined);
        assert_eq!(state.restart_count, 5);

        let quarantined = h.events_of(EventKind::Quarantined);
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].severity, Severity::Critical);
        assert_eq!(quarantined[0].automated_action.as_deref(), Some("quarantine"));
        assert_eq!(h.events_of(EventKind::RestartScheduled).len(), 5);
        assert_eq!(h.events_of(EventKind::Restarted).len(), 5);

        // Only an operator brings it back
        assert!(h.orch.control().clear_quarantine("x").await?);
        let state = h.orch.registry().state("x")?;
        assert_eq!(state.status, UnitStatus::Stopped);
        assert_eq!(state.consecutive_failure_count, 0);
        assert!(!h.orch.control().clear_quarantine("x").await?);

        h.orch.control().start("x").await?;
        assert_eq!(h.status("x"), UnitStatus::Running);
        assert_eq!(backend.spawn_count("x"), 7);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_exit_settles_stopped_under_on_failure() -> Result<()> {
        let backend = FakeBackend::new();
        backend.script("job", [Script::ExitAfter(Duration::from_secs(10), 0)]);
        let h = harness(vec![unit("job")], backend.clone());

        h.orch.start().await?;
        sleep(Duration::from_secs(60)).await;

        assert_eq!(h.status("job"), UnitStatus::Stopped);
        assert_eq!(backend.spawn_count("job"), 1);
        assert_eq!(h.orch.registry().state("job")?.last_exit_code, Some(0));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_failure_restarts_after_crash() -> Result<()> {
        let backend = FakeBackend::new();
        let h = harness(vec![unit("x")], backend.clone());

        h.orch.start().await?;
        backend.crash("x", 137);
        sleep(Duration::from_secs(10)).await;

        let state = h.orch.registry().state("x")?;
        assert_eq!(state.status, UnitStatus::Running);
        assert_eq!(state.restart_count, 1);
        assert_eq!(state.consecutive_failure_count, 1);
        assert_eq!(backend.spawn_count("x"), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_and_manual_restart_spawn_once() -> Result<()> {
        let backend = FakeBackend::new();
        let h = harness(vec![unit("x")], backend.clone());

        h.orch.start().await?;
        backend.crash("x", 1);
        // Let remediation schedule its backoff, then race it
        sleep(Duration::from_millis(100)).await;
        assert_eq!(h.events_of(EventKind::RestartScheduled).len(), 1);

        h.orch.control().restart("x").await?;
        sleep(Duration::from_secs(30)).await;

        assert_eq!(backend.spawn_count("x"), 2);
        assert_eq!(h.status("x"), UnitStatus::Running);
        assert_eq!(h.orch.registry().state("x")?.restart_count, 0);
        assert!(h.events_of(EventKind::Restarted).is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_manual_restarts_coalesce() -> Result<()> {
        let backend = FakeBackend::new();
        let h = harness(vec![unit("x")], backend.clone());

        h.orch.start().await?;
        let control = h.orch.control();
        let (first, second) = tokio::join!(control.restart("x"), control.restart("x"));
        first?;
        second?;

        assert_eq!(backend.spawn_count("x"), 2);
        assert_eq!(h.status("x"), UnitStatus::Running);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_trigger_is_ignored() -> Result<()> {
        let backend = FakeBackend::new();
        let h = harness(vec![unit("x").restart(RestartPolicy::Always)], backend.clone());
        h.orch.start().await?;

        let engine = RemediationEngine::new(
            h.orch.lifecycle().clone(),
            h.orch.events().clone(),
            BackoffStrategy::default(),
            FlappingPolicy::default(),
            Duration::from_secs(60),
        );
        let generation = h.orch.registry().state("x")?.generation;
        let decision = engine.decide(&RemediationTrigger::Failed {
            unit: "x".to_string(),
            generation: generation - 1,
            exit: Some(ExitInfo::code(1)),
        })?;
        assert!(matches!(decision, Decision::Ignore(_)));

        // A live unit is not a failed one
        let decision = engine.decide(&RemediationTrigger::Failed {
            unit: "x".to_string(),
            generation,
            exit: Some(ExitInfo::code(1)),
        })?;
        assert!(matches!(decision, Decision::Ignore(_)));
        assert_eq!(h.orch.registry().state("x")?.consecutive_failure_count, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_operator_stop_cancels_pending_restart() -> Result<()> {
        let backend = FakeBackend::new();
        let h = harness(vec![unit("x").restart(RestartPolicy::Always)], backend.clone());

        h.orch.start().await?;
        backend.crash("x", 1);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(h.events_of(EventKind::RestartScheduled).len(), 1);

        h.orch.control().stop("x", false).await?;
        assert_eq!(h.status("x"), UnitStatus::Stopped);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(h.status("x"), UnitStatus::Stopped);
        assert_eq!(backend.spawn_count("x"), 1);
        assert!(h.events_of(EventKind::Restarted).is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_restart_replaces_tracked_process() -> Result<()> {
        let backend = FakeBackend::new();
        let h = harness(vec![unit("x")], backend.clone());

        h.orch.start().await?;
        // Quarantined while its process is still up
        h.orch
            .registry()
            .update("x", |s| s.status = UnitStatus::Quarantined)?;

        h.orch.control().restart("x").await?;

        assert_eq!(backend.alive_count("x"), 1);
        assert_eq!(backend.spawn_count("x"), 2);
        assert_eq!(backend.signals_for("x"), vec![StopSignal::Terminate]);
        assert_eq!(h.status("x"), UnitStatus::Running);
        assert_eq!(h.events_of(EventKind::QuarantineCleared).len(), 1);
        assert_eq!(h.orch.supervisor().live_processes().len(), 1);
        Ok(())
    }

    // ---- Health ----

    #[tokio::test(start_paused = true)]
    async fn test_hung_probe_does_not_delay_others() -> Result<()> {
        let backend = FakeBackend::new();
        let h = harness(
            vec![
                unit("fast").health_check(http_check(1, 5)),
                unit("hung").health_check(http_check(1, 5)),
            ],
            backend,
        );
        h.probe.set("hung", ProbeBehaviour::Hang);
        h.orch.start().await?;

        let health = h.orch.health().clone();
        let began = Instant::now();
        let sweep = tokio::spawn(async move { health.sweep().await });

        sleep(Duration::from_millis(50)).await;
        let fast = h.orch.registry().state("fast")?;
        assert_eq!(fast.health, HealthStatus::Healthy);
        assert!(fast.last_health_check_at.is_some());
        assert!(h.orch.registry().state("hung")?.last_health_check_at.is_none());

        assert_eq!(sweep.await.unwrap(), 2);
        assert!(began.elapsed() <= Duration::from_secs(5) + Duration::from_millis(100));
        assert_eq!(h.orch.health().consecutive_failures("hung"), 1);
        assert!(h.orch.registry().state("hung")?.last_health_check_at.is_some());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_after_threshold_then_recovers() -> Result<()> {
        let backend = FakeBackend::new();
        let h = harness(vec![unit("api").health_check(http_check(1, 2))], backend);
        h.probe.set("api", ProbeBehaviour::Fail);
        h.orch.start().await?;

        for round in 1..=3 {
            h.orch.health().sweep().await;
            let state = h.orch.registry().state("api")?;
            if round < 3 {
                assert_eq!(state.health, HealthStatus::Unknown);
                assert_eq!(state.status, UnitStatus::Running);
            } else {
                assert_eq!(state.health, HealthStatus::Unhealthy);
                assert_eq!(state.status, UnitStatus::Degraded);
            }
            sleep(Duration::from_secs(1)).await;
        }

        h.probe.set("api", ProbeBehaviour::Healthy);
        h.orch.health().sweep().await;
        let state = h.orch.registry().state("api")?;
        assert_eq!(state.health, HealthStatus::Healthy);
        assert_eq!(state.status, UnitStatus::Running);

        let changes = h.events_of(EventKind::HealthChanged);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].severity, Severity::Warning);
        assert_eq!(changes[1].severity, Severity::Info);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_respects_unit_interval() -> Result<()> {
        let backend = FakeBackend::new();
        let h = harness(vec![unit("api").health_check(http_check(10, 2))], backend);
        h.probe.set("api", ProbeBehaviour::Fail);
        h.orch.start().await?;

        assert_eq!(h.orch.health().sweep().await, 1);
        assert_eq!(h.orch.health().sweep().await, 0);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(h.orch.health().sweep().await, 1);
        assert_eq!(h.orch.health().consecutive_failures("api"), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_without_endpoint() -> Result<()> {
        let backend = FakeBackend::new();
        let h = harness(vec![unit("worker")], backend.clone());
        h.orch.start().await?;

        h.orch.health().sweep().await;
        assert_eq!(h.orch.registry().state("worker")?.health, HealthStatus::Healthy);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_unhealthy_requests_restart() -> Result<()> {
        let backend = FakeBackend::new();
        let settings = OrchestratorSettings {
            unhealthy_restart_after_secs: 10,
            ..quiet_settings()
        };
        let h = harness_with(
            vec![unit("api").health_check(http_check(1, 2))],
            settings,
            backend.clone(),
            Arc::new(IdleSampler),
        );
        h.probe.set("api", ProbeBehaviour::Fail);
        h.orch.start().await?;

        for _ in 0..3 {
            h.orch.health().sweep().await;
            sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(h.status("api"), UnitStatus::Degraded);
        assert_eq!(backend.spawn_count("api"), 1);

        sleep(Duration::from_secs(10)).await;
        h.orch.health().sweep().await;
        sleep(Duration::from_secs(10)).await;

        assert_eq!(backend.spawn_count("api"), 2);
        assert_eq!(backend.signals_for("api"), vec![StopSignal::Terminate]);
        let state = h.orch.registry().state("api")?;
        assert_eq!(state.restart_count, 1);
        assert_eq!(state.status, UnitStatus::Running);
        assert_eq!(state.health, HealthStatus::Unknown);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_flapping_quarantine_stops_process() -> Result<()> {
        let backend = FakeBackend::new();
        let settings = OrchestratorSettings {
            probe_failure_threshold: 1,
            unhealthy_restart_after_secs: 0,
            flapping_threshold: 1,
            ..quiet_settings()
        };
        let h = harness_with(
            vec![unit("api")
                .restart(RestartPolicy::Always)
                .health_check(http_check(1, 2))],
            settings,
            backend.clone(),
            Arc::new(IdleSampler),
        );
        h.probe.set("api", ProbeBehaviour::Fail);
        h.orch.start().await?;

        // First bad sweep restarts, the second trips the flapping threshold
        h.orch.health().sweep().await;
        sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.spawn_count("api"), 2);
        assert_eq!(h.status("api"), UnitStatus::Running);

        h.orch.health().sweep().await;
        sleep(Duration::from_secs(1)).await;

        let state = h.orch.registry().state("api")?;
        assert_eq!(state.status, UnitStatus::Quarantined);
        assert_eq!(state.pid, None);
        assert_eq!(backend.alive_count("api"), 0);
        assert!(h.orch.supervisor().live_processes().is_empty());
        assert_eq!(h.events_of(EventKind::Quarantined).len(), 1);

        // Nothing brings it back on its own
        sleep(Duration::from_secs(400)).await;
        assert_eq!(h.status("api"), UnitStatus::Quarantined);
        assert_eq!(backend.spawn_count("api"), 2);
        Ok(())
    }

    // ---- Resources ----

    fn memory_sampler(memory: Arc<AtomicU64>) -> Arc<dyn ResourceSampler> {
        let mut sampler = MockResourceSampler::new();
        sampler.expect_sample().returning(move |_| {
            Ok(RawUsage {
                cpu_time: Duration::from_secs(1),
                memory_bytes: memory.load(Ordering::SeqCst),
            })
        });
        Arc::new(sampler)
    }

    fn limited(id: &str, memory_mb: f64) -> UnitDefinition {
        unit(id).limits(ResourceLimits {
            cpu_percent: None,
            memory_mb: Some(memory_mb),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_warning_is_edge_triggered() -> Result<()> {
        let backend = FakeBackend::new();
        let memory = Arc::new(AtomicU64::new(460 * MB));
        let h = harness_with(
            vec![limited("y", 500.0)],
            quiet_settings(),
            backend.clone(),
            memory_sampler(memory.clone()),
        );
        h.orch.start().await?;
        let pid = h.orch.registry().state("y")?.pid;

        for _ in 0..3 {
            h.orch.resources().sweep();
        }

        let warnings = h.events_of(EventKind::ResourceWarning);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].severity, Severity::Warning);
        assert!(warnings[0].details.contains("92%"), "{}", warnings[0].details);
        assert!(h.events_of(EventKind::ResourceBreach).is_empty());
        assert_eq!(h.orch.resources().level("y", Metric::MemoryMb), LimitLevel::Warning);

        // Advisory only: nothing about the unit changes
        let state = h.orch.registry().state("y")?;
        assert_eq!(state.status, UnitStatus::Running);
        assert_eq!(state.pid, pid);
        assert_eq!(backend.spawn_count("y"), 1);
        assert!(backend.signals().is_empty());

        memory.store(100 * MB, Ordering::SeqCst);
        h.orch.resources().sweep();
        h.orch.resources().sweep();
        let recovered = h.events_of(EventKind::ResourceRecovered);
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].severity, Severity::Info);

        let latest = h.orch.resources().latest("y").unwrap();
        assert!((latest.memory_mb - 100.0).abs() < 1e-9);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_kill_on_breach() -> Result<()> {
        let backend = FakeBackend::new();
        let settings = OrchestratorSettings {
            hard_kill_on_breach: true,
            ..quiet_settings()
        };
        let h = harness_with(
            vec![limited("hog", 500.0).restart(RestartPolicy::Never)],
            settings,
            backend.clone(),
            memory_sampler(Arc::new(AtomicU64::new(600 * MB))),
        );
        h.orch.start().await?;

        h.orch.resources().sweep();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(h.events_of(EventKind::ResourceBreach).len(), 1);
        let kills = h.events_of(EventKind::ResourceKill);
        assert_eq!(kills.len(), 1);
        assert_eq!(kills[0].automated_action.as_deref(), Some("kill"));
        assert_eq!(backend.signals_for("hog"), vec![StopSignal::Kill]);
        assert_eq!(h.status("hog"), UnitStatus::Failed);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_warning_repeats_for_new_process() -> Result<()> {
        let backend = FakeBackend::new();
        let h = harness_with(
            vec![limited("y", 500.0)],
            quiet_settings(),
            backend.clone(),
            memory_sampler(Arc::new(AtomicU64::new(460 * MB))),
        );
        h.orch.start().await?;

        h.orch.resources().sweep();
        assert_eq!(h.events_of(EventKind::ResourceWarning).len(), 1);

        backend.crash("y", 1);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.spawn_count("y"), 2);
        assert_eq!(h.status("y"), UnitStatus::Running);

        h.orch.resources().sweep();
        assert_eq!(h.events_of(EventKind::ResourceWarning).len(), 2);
        assert_eq!(h.orch.resources().level("y", Metric::MemoryMb), LimitLevel::Warning);
        Ok(())
    }

    // ---- Control surface and shutdown ----

    #[tokio::test(start_paused = true)]
    async fn test_control_surface_queries() -> Result<()> {
        let backend = FakeBackend::new();
        let h = harness(vec![unit("x"), unit("y").role("api")], backend);
        h.orch.start().await?;

        let control = h.orch.control();
        assert_eq!(control.status().len(), 2);
        let x = control.unit("x")?;
        assert_eq!(x.status, UnitStatus::Running);
        assert!(x.pid.is_some());
        assert!(x.status_summary().starts_with("x running"));

        let err = control.unit("nope").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::UnknownUnit(_))
        ));
        assert!(control.stop("bad id!", false).await.is_err());

        let mut stream = Box::pin(control.subscribe());
        control.stop("x", false).await?;
        assert_eq!(stream.next().await.unwrap().kind, EventKind::Stopping);
        assert_eq!(stream.next().await.unwrap().kind, EventKind::Stopped);

        let for_x = control.events(&EventQuery::for_unit("x"));
        assert!(for_x.iter().all(|e| e.unit_id.as_deref() == Some("x")));
        assert!(for_x.windows(2).all(|w| w[0].sequence < w[1].sequence));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything_and_writes_snapshot() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let state_path = dir.path().join("state.json");
        let backend = FakeBackend::new();
        let settings = OrchestratorSettings {
            state_path: Some(state_path.clone()),
            ..quiet_settings()
        };
        let h = harness_with(
            vec![unit("a"), unit("b").depends_on(["a"])],
            settings,
            backend.clone(),
            Arc::new(IdleSampler),
        );

        h.orch.start().await?;
        h.orch.shutdown().await?;

        assert_eq!(h.status("a"), UnitStatus::Stopped);
        assert_eq!(h.status("b"), UnitStatus::Stopped);
        assert_eq!(h.events_of(EventKind::ShutdownStarted).len(), 1);
        assert_eq!(h.events_of(EventKind::ShutdownComplete).len(), 1);
        assert!(h.events_of(EventKind::ShutdownTimeout).is_empty());
        assert!(h.orch.cancellation_token().is_cancelled());

        let snapshot: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&state_path)?)?;
        assert_eq!(snapshot["units"]["a"]["status"], "Stopped");
        assert_eq!(snapshot["units"]["b"]["manually_stopped"], true);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_timeout_force_kills() -> Result<()> {
        let backend = FakeBackend::new();
        backend.ignore_term("stubborn");
        let settings = OrchestratorSettings {
            shutdown_timeout_secs: 5,
            ..quiet_settings()
        };
        let h = harness_with(
            vec![unit("stubborn")],
            settings,
            backend.clone(),
            Arc::new(IdleSampler),
        );

        h.orch.start().await?;
        h.orch.shutdown().await?;

        let timeouts = h.events_of(EventKind::ShutdownTimeout);
        assert_eq!(timeouts.len(), 1);
        assert_eq!(timeouts[0].automated_action.as_deref(), Some("sigkill"));
        assert_eq!(
            backend.signals_for("stubborn"),
            vec![StopSignal::Terminate, StopSignal::Kill]
        );
        assert_eq!(h.status("stubborn"), UnitStatus::Stopped);
        assert!(h.orch.supervisor().live_processes().is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_respects_one_total_deadline() -> Result<()> {
        let backend = FakeBackend::new();
        backend.ignore_term("stubborn");
        let settings = OrchestratorSettings {
            probe_failure_threshold: 1,
            unhealthy_restart_after_secs: 0,
            stop_timeout_secs: 20,
            shutdown_timeout_secs: 5,
            ..quiet_settings()
        };
        let h = harness_with(
            vec![unit("stubborn")
                .restart(RestartPolicy::Always)
                .health_check(http_check(1, 2))],
            settings,
            backend.clone(),
            Arc::new(IdleSampler),
        );
        h.probe.set("stubborn", ProbeBehaviour::Fail);
        h.orch.start().await?;

        // A remediation restart is stuck waiting on SIGTERM when shutdown begins
        h.orch.health().sweep().await;
        sleep(Duration::from_secs(2)).await;
        assert_eq!(backend.signals_for("stubborn"), vec![StopSignal::Terminate]);

        let began = Instant::now();
        h.orch.shutdown().await?;
        assert!(
            began.elapsed() <= Duration::from_secs(6),
            "shutdown took {:?}",
            began.elapsed()
        );

        assert_eq!(h.events_of(EventKind::ShutdownTimeout).len(), 1);
        assert_eq!(h.status("stubborn"), UnitStatus::Stopped);
        assert!(h.orch.supervisor().live_processes().is_empty());

        // The interrupted restart never respawns
        sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.spawn_count("stubborn"), 1);
        assert_eq!(backend.alive_count("stubborn"), 0);
        Ok(())
    }
}
