//! Executor ordering and mutual exclusion.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lab_orchestrator::executor::StateMachineExecutor;
use lab_orchestrator::state_machine::{Actions, RetryPolicy, StateMachine, TransitionTable, Trigger};
use parking_lot::Mutex;
use tokio_test::assert_ok;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Phase {
    Idle,
    Work,
    WorkError,
    Done,
    Aborted,
}

/// Shared record of every run on one device.
#[derive(Default)]
struct Device {
    running: AtomicUsize,
    max_running: AtomicUsize,
    intervals: Mutex<Vec<(String, Instant, Instant)>>,
}

struct Job {
    name: String,
    work: Duration,
    device: Arc<Device>,
}

type Workflow = StateMachine<Job, Phase, Trigger>;

fn workflow(device: &Arc<Device>, name: &str, work: Duration) -> Workflow {
    let table = TransitionTable::builder(Phase::Idle, Phase::Done, Phase::Aborted)
        .permit(Phase::Idle, Trigger::Success, Phase::Work)
        .step(Phase::Work, Phase::Done, Phase::WorkError)
        .build()
        .expect("valid table");
    let actions = Actions::new().on_entry(Phase::Work, |job: Arc<Job>| async move {
        let started = Instant::now();
        let running = job.device.running.fetch_add(1, Ordering::SeqCst) + 1;
        job.device.max_running.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(job.work).await;
        job.device.running.fetch_sub(1, Ordering::SeqCst);
        job.device
            .intervals
            .lock()
            .push((job.name.clone(), started, Instant::now()));
        anyhow::Ok(Trigger::Success)
    });
    let job = Job {
        name: name.to_string(),
        work,
        device: device.clone(),
    };
    StateMachine::new(name, Arc::new(table), actions, Arc::new(job), Arc::new(RetryPolicy::never()))
        .expect("complete actions")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_runs_never_overlap() {
    let device = Arc::new(Device::default());
    let executor = Arc::new(StateMachineExecutor::new("Hitpicker"));
    executor.start();

    // submit from several tasks at once
    let mut submitters = Vec::new();
    for task in 0..4 {
        let executor = executor.clone();
        let device = device.clone();
        submitters.push(tokio::spawn(async move {
            let mut done = Vec::new();
            for i in 0..3 {
                let work = Duration::from_millis(2 + (i * task) % 5);
                done.push(executor.submit(workflow(&device, &format!("t{task}-{i}"), work)));
            }
            for completion in done {
                assert_ok!(completion.await.expect("completion"));
            }
        }));
    }
    for submitter in submitters {
        submitter.await.expect("submitter");
    }

    assert_eq!(device.max_running.load(Ordering::SeqCst), 1);
    let mut intervals = device.intervals.lock().clone();
    assert_eq!(intervals.len(), 12);
    intervals.sort_by_key(|(_, start, _)| *start);
    for pair in intervals.windows(2) {
        let (ref first, _, first_end) = pair[0];
        let (ref second, second_start, _) = pair[1];
        assert!(first_end <= second_start, "{first} overlaps {second}");
    }
    executor.stop().await;
}

#[tokio::test]
async fn test_completes_in_enqueue_order() {
    let device = Arc::new(Device::default());
    let executor = StateMachineExecutor::new("Sealer");

    // later entries are shorter, so any reordering would show
    let names: Vec<String> = (0..5).map(|i| format!("seal-{i}")).collect();
    let done: Vec<_> = names
        .iter()
        .enumerate()
        .map(|(i, name)| executor.submit(workflow(&device, name, Duration::from_millis(10 - 2 * i as u64))))
        .collect();
    assert_eq!(executor.queue_depth(), 5);

    executor.start();
    for completion in done {
        assert_ok!(completion.await.expect("completion"));
    }

    let order: Vec<String> = device.intervals.lock().iter().map(|(n, _, _)| n.clone()).collect();
    assert_eq!(order, names);
    assert!(!executor.is_busy());
    executor.stop().await;
}

#[tokio::test]
async fn test_separate_devices_run_concurrently() {
    let sealer_log = Arc::new(Device::default());
    let stacker_log = Arc::new(Device::default());
    let sealer = StateMachineExecutor::new("Sealer");
    let stacker = StateMachineExecutor::new("Stacker");
    sealer.start();
    stacker.start();

    let started = Instant::now();
    let a = sealer.submit(workflow(&sealer_log, "seal", Duration::from_millis(100)));
    let b = stacker.submit(workflow(&stacker_log, "stack", Duration::from_millis(100)));
    assert_ok!(a.await.expect("completion"));
    assert_ok!(b.await.expect("completion"));
    assert!(started.elapsed() < Duration::from_millis(190));

    sealer.stop().await;
    stacker.stop().await;
}
