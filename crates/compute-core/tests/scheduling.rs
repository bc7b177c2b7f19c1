use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use api_types::JobPriority;
use api_types::JobStatus;
use breaker::CircuitBreakerConfig;
use compute_core::clock::SystemClock;
use compute_core::devices::GpuDevice;
use compute_core::scheduler::job_fn;
use compute_core::scheduler::GpuJobRequest;
use compute_core::scheduler::GpuJobScheduler;
use compute_core::scheduler::JobError;
use compute_core::scheduler::JobType;
use compute_core::scheduler::SchedulerConfig;
use similar_asserts::assert_eq;
use test_log::test;
use tokio_util::sync::CancellationToken;

type StartLog = Arc<Mutex<Vec<String>>>;

fn scheduler(devices: Vec<GpuDevice>) -> GpuJobScheduler {
    let config = SchedulerConfig {
        idle_backoff_min: Duration::from_millis(5),
        idle_backoff_max: Duration::from_millis(20),
        ..SchedulerConfig::default()
    };
    GpuJobScheduler::new(devices, config, Arc::new(SystemClock)).unwrap()
}

/// Job that records when it starts and then works for `work`.
fn logged_job(
    job_id: &str,
    priority: JobPriority,
    memory_mb: u64,
    work: Duration,
    starts: &StartLog,
) -> GpuJobRequest {
    let starts = starts.clone();
    let name = job_id.to_string();
    GpuJobRequest::new(
        JobType::Custom("enhance".to_string()),
        job_fn(move |ctx| {
            let starts = starts.clone();
            let name = name.clone();
            async move {
                starts.lock().unwrap().push(name);
                tokio::time::sleep(work).await;
                Ok(serde_json::json!({ "device": ctx.device_id }))
            }
        }),
    )
    .with_id(job_id)
    .with_priority(priority)
    .with_memory(memory_mb)
}

fn spawn_loop(sched: &GpuJobScheduler) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let token = CancellationToken::new();
    let handle = tokio::spawn({
        let sched = sched.clone();
        let token = token.clone();
        async move { sched.run(token).await }
    });
    (token, handle)
}

#[test(tokio::test)]
async fn critical_job_overtakes_queued_normal_jobs() {
    let sched = scheduler(vec![GpuDevice::new(0, "sim-8g", 8192)]);
    let starts = StartLog::default();

    for i in 0..5 {
        sched
            .submit_job(logged_job(
                &format!("normal-{i}"),
                JobPriority::Normal,
                512,
                Duration::from_millis(50),
                &starts,
            ))
            .unwrap();
    }
    sched
        .submit_job(logged_job(
            "critical",
            JobPriority::Critical,
            512,
            Duration::from_millis(50),
            &starts,
        ))
        .unwrap();

    let began = Instant::now();
    let (token, handle) = spawn_loop(&sched);
    assert!(sched.wait_for_idle(Duration::from_secs(2)).await);
    assert!(began.elapsed() < Duration::from_secs(2));
    token.cancel();
    handle.await.unwrap();

    let starts = starts.lock().unwrap().clone();
    assert_eq!(starts.len(), 6);
    assert_eq!(starts[0], "critical");
    assert_eq!(
        starts[1..].to_vec(),
        (0..5).map(|i| format!("normal-{i}")).collect::<Vec<_>>()
    );
    for job in sched.list_jobs() {
        assert_eq!(job.status, JobStatus::Completed, "job {}", job.job_id);
    }
}

#[test(tokio::test)]
async fn high_priority_starts_before_low() {
    let sched = scheduler(vec![GpuDevice::new(0, "sim", 4096)]);
    let starts = StartLog::default();
    sched
        .submit_job(logged_job("low", JobPriority::Low, 256, Duration::from_millis(5), &starts))
        .unwrap();
    sched
        .submit_job(logged_job("high", JobPriority::High, 256, Duration::from_millis(5), &starts))
        .unwrap();

    let (token, handle) = spawn_loop(&sched);
    assert!(sched.wait_for_idle(Duration::from_secs(2)).await);
    token.cancel();
    handle.await.unwrap();

    assert_eq!(*starts.lock().unwrap(), vec!["high".to_string(), "low".to_string()]);
}

#[test(tokio::test)]
async fn device_memory_balances_while_jobs_run() {
    let sched = scheduler(vec![GpuDevice::new(0, "a", 2048), GpuDevice::new(1, "b", 4096)]);
    let gate = CancellationToken::new();
    for (job_id, memory_mb) in [("small", 1024), ("large", 3072)] {
        let gate = gate.clone();
        sched
            .submit_job(
                GpuJobRequest::new(
                    JobType::Custom("hold".to_string()),
                    job_fn(move |_| {
                        let gate = gate.clone();
                        async move {
                            gate.cancelled().await;
                            Ok(serde_json::Value::Null)
                        }
                    }),
                )
                .with_id(job_id)
                .with_memory(memory_mb),
            )
            .unwrap();
    }

    let report = sched.dispatch_once();
    assert_eq!(report.dispatched, 2);
    let mut allocated = 0;
    for device in sched.devices() {
        assert_eq!(
            device.available_memory_mb() + device.allocated_mb(),
            device.total_memory_mb
        );
        allocated += device.allocated_mb();
    }
    assert_eq!(allocated, 4096);
    assert_eq!(sched.active_jobs(), 2);

    gate.cancel();
    assert!(sched.wait_for_idle(Duration::from_secs(2)).await);
    for device in sched.devices() {
        assert_eq!(device.available_memory_mb(), device.total_memory_mb);
        assert!(device.current_job.is_none());
    }
}

#[test(tokio::test)]
async fn every_job_ends_with_exactly_one_terminal_result() {
    let sched = scheduler(vec![GpuDevice::new(0, "sim", 4096)]);
    let ok = GpuJobRequest::new(
        JobType::Custom("ok".to_string()),
        job_fn(|_| async { Ok(serde_json::json!("done")) }),
    )
    .with_id("ok");
    let failing = GpuJobRequest::new(
        JobType::Custom("fail".to_string()),
        job_fn(|_| async { Err(JobError::Failed("bad input frame".to_string())) }),
    )
    .with_id("failing");
    let panicking = GpuJobRequest::new(
        JobType::Custom("panic".to_string()),
        job_fn(|_| async {
            if true {
                panic!("kernel exploded");
            }
            Ok(serde_json::Value::Null)
        }),
    )
    .with_id("panicking");
    let slow = GpuJobRequest::new(
        JobType::Custom("slow".to_string()),
        job_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(serde_json::Value::Null)
        }),
    )
    .with_id("slow")
    .with_timeout(Duration::from_millis(50));
    let oversize = GpuJobRequest::new(
        JobType::Custom("huge".to_string()),
        job_fn(|_| async { Ok(serde_json::Value::Null) }),
    )
    .with_id("oversize")
    .with_memory(1 << 20);

    for request in [ok, failing, panicking, slow, oversize] {
        sched.submit_job(request).unwrap();
    }

    let (token, handle) = spawn_loop(&sched);
    assert!(sched.wait_for_idle(Duration::from_secs(5)).await);
    token.cancel();
    handle.await.unwrap();

    let expected = [
        ("ok", JobStatus::Completed),
        ("failing", JobStatus::Failed),
        ("panicking", JobStatus::Failed),
        ("slow", JobStatus::Timeout),
        ("oversize", JobStatus::Failed),
    ];
    for (job_id, status) in expected {
        let result = sched.get_job_result(job_id).unwrap();
        assert_eq!(result.status, status, "job {job_id}");
    }
    let oversize = sched.get_job_result("oversize").unwrap();
    assert!(oversize.started_at.is_none());
    assert!(oversize
        .error_message
        .unwrap()
        .contains("Insufficient capacity"));

    let metrics = sched.get_performance_metrics();
    assert_eq!(metrics.statistics.submitted, 5);
    assert_eq!(metrics.statistics.completed, 1);
    assert_eq!(metrics.statistics.failed, 3);
    assert_eq!(metrics.statistics.timed_out, 1);
    assert_eq!(metrics.queue_metrics.queue_length, 0);
    let optimization = sched.optimize_scheduling();
    assert!((0.0..=1.0).contains(&optimization.optimization_score));
}

#[test(tokio::test)]
async fn running_job_observes_cancellation_and_frees_its_device() {
    let sched = scheduler(vec![GpuDevice::new(0, "sim", 4096)]);
    let job_id = sched
        .submit_job(
            GpuJobRequest::new(
                JobType::Custom("stream".to_string()),
                job_fn(|ctx| async move {
                    ctx.cancellation.cancelled().await;
                    Err(JobError::Cancelled)
                }),
            )
            .with_id("stream-1")
            .with_memory(1024),
        )
        .unwrap();

    assert_eq!(sched.dispatch_once().dispatched, 1);
    assert_eq!(sched.devices()[0].available_memory_mb(), 3072);

    assert!(sched.cancel_job(&job_id));
    assert!(sched.wait_for_idle(Duration::from_secs(2)).await);

    let result = sched.get_job_result(&job_id).unwrap();
    assert_eq!(result.status, JobStatus::Cancelled);
    let device = &sched.devices()[0];
    assert_eq!(device.available_memory_mb(), 4096);
    assert!(device.current_job.is_none());
    assert!(!sched.cancel_job(&job_id));
}

#[test(tokio::test)]
async fn repeated_failures_open_the_breaker_for_later_jobs() {
    let config = SchedulerConfig {
        breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            ..CircuitBreakerConfig::default()
        },
        ..SchedulerConfig::default()
    };
    let sched = GpuJobScheduler::new(
        vec![GpuDevice::new(0, "sim", 4096)],
        config,
        Arc::new(SystemClock),
    )
    .unwrap();

    let mut results = Vec::new();
    for n in 0..4 {
        let job_id = sched
            .submit_job(
                GpuJobRequest::new(
                    JobType::Custom("flaky".to_string()),
                    job_fn(|_| async { Err(JobError::Failed("decoder crashed".to_string())) }),
                )
                .with_id(format!("flaky-{n}"))
                .with_memory(256),
            )
            .unwrap();
        assert_eq!(sched.dispatch_once().dispatched, 1);
        assert!(sched.wait_for_idle(Duration::from_secs(2)).await);
        results.push(sched.get_job_result(&job_id).unwrap());
    }

    for result in &results[..3] {
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.error_message.as_deref(), Some("decoder crashed"));
    }
    assert_eq!(results[3].status, JobStatus::Failed);
    assert_eq!(
        results[3].error_message.as_deref(),
        Some("circuit breaker open")
    );
    assert_eq!(sched.devices()[0].available_memory_mb(), 4096);
}
