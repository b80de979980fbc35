//! Capture loop tests against scripted process listings and host probes

#[cfg(test)]
mod orchestrator_tests {
    use crate::capture::*;
    use crate::history::History;
    use crate::models::{MemoryUtilization, ProcessKind};
    use crate::sampler::{MetricKind, SampleCache};
    use crate::shutdown::StopSignal;
    use crate::tracker::{
        LabelCriteria, LabelCriterion, ListedProcess, ProcessSource, ProcessTracker, TrackerError,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::RwLock;

    struct MockSource {
        listing: Mutex<Result<Vec<ListedProcess>, String>>,
        calls: AtomicUsize,
    }

    impl MockSource {
        fn new(pids: &[u32]) -> Self {
            let source = Self {
                listing: Mutex::new(Ok(Vec::new())),
                calls: AtomicUsize::new(0),
            };
            source.set(pids);
            source
        }

        fn set(&self, pids: &[u32]) {
            let listed = pids
                .iter()
                .map(|pid| ListedProcess {
                    pid: *pid,
                    name: "app".to_string(),
                    cmdline: Some(format!(
                        "app --role={}",
                        if pid % 2 == 0 { "render" } else { "io" }
                    )),
                })
                .collect();
            *self.listing.lock().unwrap() = Ok(listed);
        }

        fn fail(&self) {
            *self.listing.lock().unwrap() = Err("boom".to_string());
        }
    }

    #[async_trait]
    impl ProcessSource for MockSource {
        async fn list(&self, _name: &str) -> Result<Vec<ListedProcess>, TrackerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.listing
                .lock()
                .unwrap()
                .clone()
                .map_err(TrackerError::Listing)
        }
    }

    struct MockProbe {
        memory: Mutex<HashMap<u32, MemoryUtilization>>,
    }

    impl MockProbe {
        fn new() -> Self {
            Self {
                memory: Mutex::new(HashMap::new()),
            }
        }

        fn set(&self, pid: u32, rss_mb: f64, uss_mb: f64) {
            self.memory.lock().unwrap().insert(
                pid,
                MemoryUtilization {
                    rss_mb,
                    uss_mb,
                    vms_mb: rss_mb * 4.0,
                    ..Default::default()
                },
            );
        }
    }

    #[async_trait]
    impl HostProbe for MockProbe {
        async fn process_memory(&self, pid: u32) -> Result<MemoryUtilization, ProbeError> {
            self.memory
                .lock()
                .unwrap()
                .get(&pid)
                .copied()
                .ok_or(ProbeError::ProcessGone(pid))
        }

        async fn system_snapshot(&self) -> Result<SystemSnapshot, ProbeError> {
            Ok(SystemSnapshot {
                cpu_percent: 250.0,
                total_memory_mb: 16000.0,
                free_memory_mb: 9000.0,
            })
        }
    }

    struct Fixture {
        source: Arc<MockSource>,
        probe: Arc<MockProbe>,
        tracker: Arc<ProcessTracker>,
        caches: SamplerCaches,
        history: Arc<RwLock<History>>,
    }

    impl Fixture {
        fn new(pids: &[u32]) -> Self {
            let probe = Arc::new(MockProbe::new());
            for pid in pids {
                probe.set(*pid, *pid as f64 * 100.0, *pid as f64);
            }
            let criteria = LabelCriteria::new(vec![LabelCriterion::new("render", "renderer")]);

            Self {
                source: Arc::new(MockSource::new(pids)),
                probe,
                tracker: Arc::new(ProcessTracker::new("app", criteria)),
                caches: SamplerCaches {
                    cpu: SampleCache::new(MetricKind::Cpu),
                    gpu: Some(SampleCache::new(MetricKind::Gpu)),
                    memory: SampleCache::new(MetricKind::Memory),
                    virtual_size: SampleCache::new(MetricKind::VirtualSize),
                },
                history: Arc::new(RwLock::new(History::new(100))),
            }
        }

        fn orchestrator(&self, config: CaptureConfig) -> CaptureOrchestrator {
            CaptureOrchestrator::new(
                CaptureConfig {
                    target: "app".to_string(),
                    ..config
                },
                self.source.clone(),
                self.tracker.clone(),
                self.probe.clone(),
                self.caches.clone(),
                self.history.clone(),
            )
        }

        async fn records(&self) -> Vec<crate::models::HistoryRecord> {
            self.history.read().await.offset_from(0)
        }
    }

    fn kinds(records: &[crate::models::HistoryRecord]) -> Vec<ProcessKind> {
        records.iter().map(|r| r.process.kind).collect()
    }

    #[tokio::test]
    async fn test_aggregate_sums_every_field() {
        let fixture = Fixture::new(&[1, 2, 3]);
        for (pid, cpu) in [(1, 10.0), (2, 20.0), (3, 30.0)] {
            fixture.caches.cpu.publish(pid, cpu);
            fixture.caches.gpu.as_ref().unwrap().publish(pid, cpu / 10.0);
            fixture.caches.memory.publish(pid, cpu * 2.0);
            fixture.caches.virtual_size.publish(pid, cpu * 5.0);
        }
        let mut capture = fixture.orchestrator(CaptureConfig {
            system_record: false,
            ..Default::default()
        });

        let outcome = capture.tick().await;
        assert_eq!(outcome, CycleOutcome::Captured { records: 4 });

        let records = fixture.records().await;
        let aggregate = records.last().unwrap();
        assert_eq!(aggregate.process.kind, ProcessKind::AggregateTotal);
        assert_eq!(aggregate.cpu_percent, 60.0);
        assert_eq!(aggregate.gpu_percent, 6.0);
        assert_eq!(aggregate.memory.rss_mb, 600.0);
        assert_eq!(aggregate.memory.uss_mb, 6.0);
        assert_eq!(aggregate.memory.vms_mb, 2400.0);
        assert_eq!(aggregate.memory.external_mb, 120.0);
        assert_eq!(aggregate.memory.virtual_size_mb, 300.0);
        // Machine figures are copied, not summed
        assert_eq!(aggregate.memory.system_total_mb, 16000.0);
        assert_eq!(aggregate.memory.system_free_mb, 9000.0);
    }

    #[tokio::test]
    async fn test_per_process_records_precede_aggregates() {
        let fixture = Fixture::new(&[1, 2, 3]);
        let mut capture = fixture.orchestrator(CaptureConfig::default());

        capture.tick().await;

        let records = fixture.records().await;
        assert_eq!(
            kinds(&records),
            vec![
                ProcessKind::Tracked(1),
                ProcessKind::Tracked(2),
                ProcessKind::Tracked(3),
                ProcessKind::AggregateTotal,
                ProcessKind::WholeSystem,
            ]
        );
        assert!(records.iter().all(|r| r.timestamp == records[0].timestamp));

        let system = records.last().unwrap();
        assert_eq!(system.cpu_percent, 250.0);
        assert_eq!(system.memory.rss_mb, 7000.0);
    }

    #[tokio::test]
    async fn test_records_carry_labels() {
        let fixture = Fixture::new(&[1, 2]);
        let mut capture = fixture.orchestrator(CaptureConfig::default());

        capture.tick().await;

        let records = fixture.records().await;
        assert_eq!(records[0].process.label.as_deref(), Some("main process"));
        assert_eq!(records[1].process.label.as_deref(), Some("renderer"));
        assert_eq!(records[2].process.label.as_deref(), Some("total"));
        assert!(records.iter().all(|r| r.process.target_name == "app"));
    }

    #[tokio::test]
    async fn test_totals_only_skips_per_process_records() {
        let fixture = Fixture::new(&[1, 2]);
        let mut capture = fixture.orchestrator(CaptureConfig {
            totals_only: true,
            ..Default::default()
        });

        assert_eq!(capture.tick().await, CycleOutcome::Captured { records: 2 });
        assert_eq!(
            kinds(&fixture.records().await),
            vec![ProcessKind::AggregateTotal, ProcessKind::WholeSystem]
        );
    }

    #[tokio::test]
    async fn test_empty_set_skips_cycle() {
        let fixture = Fixture::new(&[]);
        let mut capture = fixture.orchestrator(CaptureConfig::default());

        assert!(matches!(capture.tick().await, CycleOutcome::Skipped(_)));
        assert!(fixture.history.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_vanished_process_is_skipped_not_fatal() {
        let fixture = Fixture::new(&[1, 2]);
        fixture.probe.memory.lock().unwrap().remove(&2);
        let mut capture = fixture.orchestrator(CaptureConfig {
            system_record: false,
            ..Default::default()
        });

        assert_eq!(capture.tick().await, CycleOutcome::Captured { records: 2 });
        assert_eq!(
            kinds(&fixture.records().await),
            vec![ProcessKind::Tracked(1), ProcessKind::AggregateTotal]
        );
    }

    #[tokio::test]
    async fn test_listing_failure_is_contained() {
        let fixture = Fixture::new(&[1]);
        fixture.source.fail();
        let mut capture = fixture.orchestrator(CaptureConfig::default());

        assert!(matches!(capture.tick().await, CycleOutcome::Failed(_)));
        assert!(fixture.history.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_pause_blocks_history_and_resume_reads_fresh_values() {
        let fixture = Fixture::new(&[1]);
        fixture.caches.cpu.publish(1, 5.0);
        let mut capture = fixture.orchestrator(CaptureConfig {
            system_record: false,
            ..Default::default()
        });
        let control = capture.control();

        capture.tick().await;
        let before = fixture.history.read().await.len();

        control.pause();
        control.pause();
        for _ in 0..5 {
            assert_eq!(capture.tick().await, CycleOutcome::Paused);
        }
        assert_eq!(fixture.history.read().await.len(), before);
        assert_eq!(fixture.source.calls.load(Ordering::SeqCst), 1);

        // Samplers keep publishing while paused
        fixture.caches.cpu.publish(1, 42.0);

        control.resume();
        control.resume();
        assert!(!control.is_paused());
        capture.tick().await;

        let records = fixture.records().await;
        assert_eq!(records.len(), before + 2);
        assert_eq!(records[before].cpu_percent, 42.0);
    }

    #[tokio::test]
    async fn test_removed_pids_are_forgotten_in_caches() {
        let fixture = Fixture::new(&[1, 2]);
        fixture.caches.cpu.publish(1, 10.0);
        fixture.caches.cpu.publish(2, 20.0);
        let mut capture = fixture.orchestrator(CaptureConfig::default());

        capture.tick().await;
        fixture.source.set(&[2]);
        capture.tick().await;

        assert_eq!(fixture.caches.cpu.read(1), 0.0);
        assert_eq!(fixture.caches.cpu.read(2), 20.0);
    }

    #[tokio::test]
    async fn test_persistence_mirrors_history() {
        let dir = TempDir::new().unwrap();
        let fixture = Fixture::new(&[1, 2]);
        let mut capture = fixture.orchestrator(CaptureConfig {
            persist: true,
            log_dir: dir.path().to_path_buf(),
            ..Default::default()
        });

        capture.tick().await;
        capture.tick().await;

        let text = std::fs::read_to_string(dir.path().join("history-app.csv")).unwrap();
        let restored = History::parse(&text, 100);
        assert_eq!(restored.records().cloned().collect::<Vec<_>>(), fixture.records().await);
    }

    #[tokio::test]
    async fn test_persistence_failure_never_aborts_capture() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let fixture = Fixture::new(&[1]);
        let mut capture = fixture.orchestrator(CaptureConfig {
            persist: true,
            log_dir: blocker,
            ..Default::default()
        });

        assert!(matches!(capture.tick().await, CycleOutcome::Captured { .. }));
        assert_eq!(fixture.history.read().await.len(), 3);
    }

    #[tokio::test]
    async fn test_run_stops_on_signal() {
        let fixture = Fixture::new(&[1]);
        let capture = fixture.orchestrator(CaptureConfig {
            period: Duration::from_millis(20),
            min_sleep: Duration::from_millis(5),
            ..Default::default()
        });
        let signal = StopSignal::new();
        let handle = tokio::spawn(capture.run(signal.listener()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        signal.notify_stop();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(fixture.history.read().await.len() >= 3);
    }

    #[test]
    fn test_capture_config_default() {
        let config = CaptureConfig::default();
        assert_eq!(config.period, Duration::from_secs(1));
        assert!(config.system_record);
        assert!(!config.persist);
        assert_eq!(
            config.next_sleep(Duration::from_millis(2000)),
            config.min_sleep
        );
    }
}
