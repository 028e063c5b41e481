//! Runtime tests: the arbiter hosted on its worker thread with a real
//! clock. Callbacks arrive from the worker, timers fire between tasks.
//!
//! Run:
//! ```bash
//! cargo test -p meridian-sim --test runtime -- --nocapture
//! ```

use std::sync::Arc;
use std::time::Duration;

use meridian_common::{Capability, NetId, NetworkCapabilities};
use meridian_core::{
    ArbiterConfig, ArbiterRuntime, Caller, RequestOptions, RuntimeError, ValidationResult,
};
use meridian_sim::agent::ScriptedAgent;
use meridian_sim::callback::TestCallback;
use meridian_sim::harness::internet;
use meridian_sim::test_util::init_tracing;
use meridian_sim::{Harness, NetworkSpec};
use quanta::Clock;

const APP: u32 = 10_001;

// ─── Shared test harness ────────────────────────────────────────────

fn spawn(config: ArbiterConfig) -> (ArbiterRuntime, Harness) {
    // Only the doubles are used; the harness's own arbiter stays idle.
    let h = Harness::new();
    let rt = ArbiterRuntime::spawn(config, h.dependencies(), Clock::new()).unwrap();
    (rt, h)
}

fn connect(rt: &ArbiterRuntime, spec: NetworkSpec, validate: bool) -> (NetId, Arc<ScriptedAgent>) {
    let agent = Arc::new(ScriptedAgent::new());
    let handle = Arc::clone(&agent);
    let net = rt
        .run_sync(move |a| {
            let net = a.register_network_agent(
                handle,
                spec.config,
                spec.caps,
                spec.link_properties,
                spec.score,
            )?;
            a.mark_connected(net)?;
            if validate {
                a.report_validation(net, ValidationResult::valid())?;
            }
            Ok::<_, meridian_common::ArbiterError>(net)
        })
        .unwrap()
        .unwrap();
    (net, agent)
}

// ─── Tests ──────────────────────────────────────────────────────────

#[test]
fn callbacks_arrive_from_the_worker() {
    init_tracing();
    let (rt, _h) = spawn(ArbiterConfig::default());
    let cb = TestCallback::with_timeout(Duration::from_secs(2));
    let listener = cb.listener();
    rt.run_sync(move |a| {
        a.register_default_network_callback(Caller::new(APP), listener)
    })
    .unwrap()
    .unwrap();

    let (wifi, _) = connect(&rt, NetworkSpec::wifi().with_score(60), true);
    cb.expect_available(wifi);
    cb.expect_caps(wifi);
    assert_eq!(rt.run_sync(|a| a.system_default_network()).unwrap(), Some(wifi));
}

#[test]
fn timers_fire_on_the_worker_without_further_tasks() {
    init_tracing();
    let config = ArbiterConfig::default().with_nascent_delay(Duration::from_millis(50));
    let (rt, _h) = spawn(config);
    let cb = TestCallback::with_timeout(Duration::from_secs(2));
    let listener = cb.listener();
    rt.run_sync(move |a| {
        a.listen_network(
            Caller::new(APP),
            NetworkCapabilities::request_default(),
            listener,
            RequestOptions::default(),
        )
    })
    .unwrap()
    .unwrap();

    let (local, agent) = connect(
        &rt,
        NetworkSpec::wifi().without_capability(Capability::Internet),
        false,
    );
    cb.expect_available(local);
    cb.expect_lost(local);
    assert!(agent.was_unwanted());
    assert_eq!(rt.run_sync(|a| a.all_networks()).unwrap(), Vec::new());
}

#[test]
fn tasks_from_many_threads_are_serialized() {
    init_tracing();
    let (rt, _h) = spawn(ArbiterConfig::default());
    let rt = Arc::new(rt);
    let threads: Vec<_> = (0..4u32)
        .map(|t| {
            let rt = Arc::clone(&rt);
            std::thread::spawn(move || {
                for i in 0..5u32 {
                    let cb = TestCallback::new();
                    let listener = cb.listener();
                    rt.run_sync(move |a| {
                        a.request_network(
                            Caller::new(APP + t),
                            internet(),
                            listener,
                            RequestOptions::default().with_intent(format!("r{i}")),
                        )
                    })
                    .unwrap()
                    .unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    let counts = rt
        .run_sync(|a| (0..4).map(|t| a.request_count_for_uid(APP + t)).collect::<Vec<_>>())
        .unwrap();
    assert_eq!(counts, vec![5, 5, 5, 5]);
}

#[test]
fn stopped_runtime_rejects_work() {
    init_tracing();
    let (mut rt, _h) = spawn(ArbiterConfig::default());
    rt.shutdown();
    assert_eq!(rt.run_sync(|_| ()), Err(RuntimeError::Disconnected));
    assert_eq!(rt.post(|_| ()), Err(RuntimeError::Disconnected));
}
