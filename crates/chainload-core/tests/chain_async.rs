// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Chain loaders driven through their asynchronous lifecycle.
#![allow(missing_docs, clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chainload_core::{
    ChainError, ChainLoader, Delegate, DeliveryKind, LoadResult, Loader, Phase,
};
use chainload_dry_tests::{
    EventLog, Gate, ImmediateLoader, RecordingListener, ScriptedLoader, ScriptedSource,
};
use common::{scheduler, wait_until, XorShift64, WAIT};

fn delegate_of<L>(loader: &L) -> Delegate<i64>
where
    L: Loader<LoadResult<i64>> + Clone + 'static,
{
    Arc::new(loader.clone())
}

#[test]
fn local_value_without_delegate_completes() {
    let sched = scheduler(2);
    let loader = ChainLoader::new(ScriptedSource::value(7_i64), sched.clone());
    let rec = RecordingListener::new();
    loader.register_listener(rec.clone());
    loader.start_loading();

    let got = rec.wait_for(1, WAIT);
    assert_eq!(got.len(), 1);
    assert!(got[0].is_complete());
    assert_eq!(*got[0].get().unwrap(), 7);
    assert!(sched.wait_idle(WAIT));
    assert_eq!(rec.len(), 1);
}

#[test]
fn defer_without_delegate_panics_on_the_worker() {
    let sched = scheduler(1);
    let loader = ChainLoader::new(ScriptedSource::<i64>::defer(), sched.clone());
    let rec = RecordingListener::new();
    loader.register_listener(rec.clone());
    loader.start_loading();

    assert!(sched.wait_idle(WAIT));
    assert_eq!(sched.stats().panicked, 1);
    assert!(rec.is_empty());
}

#[test]
fn delegate_value_is_reprocessed_exactly_once() {
    let sched = scheduler(2);
    let source = ScriptedSource::<i64>::defer().reprocess_with(|v: i64, _| Ok(v * 2));
    let probe = source.probe();
    let delegate = ImmediateLoader::new(vec![LoadResult::success(42_i64)]);
    let loader = ChainLoader::with_delegate(source, delegate_of(&delegate), sched.clone());
    let rec = RecordingListener::new();
    loader.register_listener(rec.clone());
    loader.start_loading();

    let got = rec.wait_for(1, WAIT);
    assert!(sched.wait_idle(WAIT));
    assert_eq!(rec.len(), 1);
    assert!(got[0].is_complete());
    assert_eq!(*got[0].get().unwrap(), 84);
    assert_eq!(probe.reprocessed(), vec![(42, DeliveryKind::Complete)]);
    assert_eq!(loader.phase(), Phase::LoadingSelf);
}

#[test]
fn partial_deliveries_keep_the_chain_open() {
    let sched = scheduler(2);
    let source = ScriptedSource::<i64>::defer().reprocess_with(|v: i64, _| Ok(v + 100));
    let probe = source.probe();
    let delegate = ScriptedLoader::new();
    let loader = ChainLoader::with_delegate(source, delegate_of(&delegate), sched.clone());
    let rec = RecordingListener::new();
    loader.register_listener(rec.clone());
    loader.start_loading();
    assert!(wait_until(|| loader.phase() == Phase::LoadingChain));
    assert_eq!(delegate.starts(), 1);

    delegate.deliver(&LoadResult::partial(1));
    delegate.deliver(&LoadResult::partial(2));
    let got = rec.wait_for(2, WAIT);
    assert_eq!(got.len(), 2);
    assert!(got.iter().all(LoadResult::is_partial));
    assert_eq!(loader.phase(), Phase::LoadingChain);

    delegate.deliver(&LoadResult::success(3));
    let got = rec.wait_for(3, WAIT);
    let values: Vec<i64> = got.iter().map(|r| *r.get().unwrap()).collect();
    assert_eq!(values, vec![101, 102, 103]);
    assert!(got[2].is_complete());
    assert!(sched.wait_idle(WAIT));
    assert_eq!(loader.phase(), Phase::LoadingSelf);
    assert_eq!(
        probe.reprocessed(),
        vec![
            (1, DeliveryKind::Partial),
            (2, DeliveryKind::Partial),
            (3, DeliveryKind::Complete),
        ]
    );
    // Two superseded results were released.
    assert_eq!(probe.releases(), 2);
}

#[test]
fn reprocessing_runs_on_scheduler_workers() {
    let sched = scheduler(2);
    let source = ScriptedSource::<i64>::defer();
    let probe = source.probe();
    let delegate = ImmediateLoader::new(vec![LoadResult::success(1_i64)]);
    let loader = ChainLoader::with_delegate(source, delegate_of(&delegate), sched.clone());
    let rec = RecordingListener::new();
    loader.register_listener(rec.clone());
    loader.start_loading();
    rec.wait_for(1, WAIT);

    let threads = probe.reprocess_threads();
    assert_eq!(threads.len(), 1);
    assert!(threads[0].as_deref().unwrap().starts_with("dry-delivery-"));
}

#[test]
fn delegate_failure_passes_through_without_the_hook() {
    let sched = scheduler(2);
    let source = ScriptedSource::<i64>::defer();
    let probe = source.probe();
    let delegate = ImmediateLoader::new(vec![LoadResult::<i64>::failure(ChainError::failed(
        "upstream down",
    ))]);
    let loader = ChainLoader::with_delegate(source, delegate_of(&delegate), sched.clone());
    let rec = RecordingListener::new();
    loader.register_listener(rec.clone());
    loader.start_loading();

    let got = rec.wait_for(1, WAIT);
    assert_eq!(got[0].error().unwrap().to_string(), "upstream down");
    assert!(probe.reprocessed().is_empty());
}

#[test]
fn local_failure_does_not_touch_the_delegate() {
    let sched = scheduler(2);
    let delegate = ScriptedLoader::<LoadResult<i64>>::new();
    let loader = ChainLoader::with_delegate(
        ScriptedSource::failing("bad input"),
        delegate_of(&delegate),
        sched.clone(),
    );
    let rec = RecordingListener::new();
    loader.register_listener(rec.clone());
    loader.start_loading();

    let got = rec.wait_for(1, WAIT);
    assert!(got[0].is_failure());
    assert_eq!(delegate.starts(), 0);
    assert_eq!(loader.phase(), Phase::LoadingSelf);
}

#[test]
fn innermost_loader_resolves_before_outer_hooks() {
    let sched = scheduler(3);
    let log = EventLog::new();
    let inner = ChainLoader::new(
        ScriptedSource::value(1_i64).label("inner").logging_to(&log),
        sched.clone(),
    );
    let middle = ChainLoader::with_delegate(
        ScriptedSource::<i64>::defer()
            .label("middle")
            .logging_to(&log)
            .reprocess_with(|v: i64, _| Ok(v * 10)),
        inner.clone().into_delegate(),
        sched.clone(),
    );
    let outer_source = ScriptedSource::<i64>::defer()
        .label("outer")
        .logging_to(&log)
        .reprocess_with(|v: i64, _| Ok(v + 5));
    let outer_probe = outer_source.probe();
    let outer = ChainLoader::with_delegate(outer_source, middle.clone().into_delegate(), sched.clone());
    let rec = RecordingListener::new();
    outer.register_listener(rec.clone());
    outer.start_loading();

    let got = rec.wait_for(1, WAIT);
    assert_eq!(*got[0].get().unwrap(), 15);
    assert!(sched.wait_idle(WAIT));

    let inner_done = log.position("inner:attempt").unwrap();
    let middle_hook = log.position("middle:reprocess").unwrap();
    let outer_hook = log.position("outer:reprocess").unwrap();
    assert!(inner_done < middle_hook && middle_hook < outer_hook);
    assert_eq!(log.count("middle:reprocess"), 1);
    assert_eq!(log.count("outer:reprocess"), 1);
    assert_eq!(outer_probe.max_reprocess_overlap(), 1);
}

#[test]
fn reset_during_delegate_resolution_purges_queued_work() {
    let sched = scheduler(2);
    let source = ScriptedSource::<i64>::defer().reprocess_delay(Duration::from_millis(80));
    let probe = source.probe();
    let delegate = ScriptedLoader::new();
    let loader = ChainLoader::with_delegate(source, delegate_of(&delegate), sched.clone());
    let rec = RecordingListener::new();
    loader.register_listener(rec.clone());
    loader.start_loading();
    assert!(wait_until(|| loader.phase() == Phase::LoadingChain));

    for v in 0..4_i64 {
        delegate.deliver(&LoadResult::partial(v));
    }
    // First item is being reprocessed; the rest are queued behind it.
    assert!(wait_until(|| probe.reprocessed().len() == 1));
    let owner = loader.id().owner();
    assert_eq!(sched.queued_for(owner), 3);

    loader.reset();
    assert_eq!(sched.queued_for(owner), 0);
    assert_eq!(delegate.resets(), 1);
    assert!(!delegate.is_started());
    assert_eq!(loader.phase(), Phase::Initialized);

    assert!(sched.wait_idle(WAIT));
    assert!(rec.is_empty());
    assert_eq!(probe.cancels(), 1);
    assert_eq!(probe.resets(), 1);
}

#[test]
fn attempt_finishing_after_reset_is_cancelled() {
    let sched = scheduler(1);
    let gate = Gate::new();
    let source = ScriptedSource::value(9_i64).gated(&gate);
    let probe = source.probe();
    let loader = ChainLoader::new(source, sched.clone());
    let rec = RecordingListener::new();
    loader.register_listener(rec.clone());
    loader.start_loading();
    assert!(gate.await_arrivals(1, WAIT));

    loader.reset();
    gate.open();
    assert!(sched.wait_idle(WAIT));
    assert!(rec.is_empty());
    assert_eq!(probe.cancels(), 1);
    assert_eq!(probe.releases(), 1);
    assert!(loader.last_result().is_none());
}

#[test]
fn restart_redelivers_the_cached_result() {
    let sched = scheduler(2);
    let source = ScriptedSource::value(3_i64);
    let probe = source.probe();
    let loader = ChainLoader::new(source, sched.clone());
    let rec = RecordingListener::new();
    loader.register_listener(rec.clone());
    loader.start_loading();
    rec.wait_for(1, WAIT);
    assert!(sched.wait_idle(WAIT));

    loader.start_loading();
    let got = rec.wait_for(2, WAIT);
    assert_eq!(got.len(), 2);
    assert_eq!(*got[1].get().unwrap(), 3);
    assert!(sched.wait_idle(WAIT));
    assert_eq!(probe.attempts(), 1);
    assert_eq!(probe.starts(), 2);
}

#[test]
fn force_load_supersedes_and_releases() {
    let sched = scheduler(2);
    let source = ScriptedSource::value(1_i64);
    let probe = source.probe();
    let loader = ChainLoader::new(source, sched.clone());
    let rec = RecordingListener::new();
    loader.register_listener(rec.clone());
    loader.start_loading();
    rec.wait_for(1, WAIT);

    loader.force_load();
    rec.wait_for(2, WAIT);
    assert!(sched.wait_idle(WAIT));
    assert_eq!(probe.attempts(), 2);
    assert_eq!(probe.releases(), 1);

    loader.reset();
    assert_eq!(probe.releases(), 2);
}

#[test]
fn delegate_deliveries_without_a_chain_are_ignored() {
    let sched = scheduler(2);
    let delegate = ScriptedLoader::new();
    let loader = ChainLoader::with_delegate(
        ScriptedSource::value(5_i64),
        delegate_of(&delegate),
        sched.clone(),
    );
    let rec = RecordingListener::new();
    loader.register_listener(rec.clone());
    loader.start_loading();
    rec.wait_for(1, WAIT);

    // Someone else drives the delegate; the parent is not loading its chain.
    delegate.start_loading();
    assert_eq!(delegate.deliver(&LoadResult::success(99)), 1);
    assert!(sched.wait_idle(WAIT));
    assert_eq!(rec.len(), 1);
}

#[test]
fn abandoned_loader_stops_delivering() {
    let sched = scheduler(1);
    let gate = Gate::new();
    let source = ScriptedSource::value(1_i64).gated(&gate);
    let probe = source.probe();
    let loader = ChainLoader::new(source, sched.clone());
    let rec = RecordingListener::new();
    loader.register_listener(rec.clone());
    loader.start_loading();
    assert!(gate.await_arrivals(1, WAIT));

    loader.abandon();
    assert!(loader.is_abandoned());
    gate.open();
    assert!(sched.wait_idle(WAIT));
    assert!(rec.is_empty());
    assert_eq!(probe.abandons(), 1);
    assert_eq!(probe.cancels(), 1);
}

#[test]
fn delegate_deliveries_after_a_complete_keep_flowing() {
    let sched = scheduler(2);
    let source = ScriptedSource::<i64>::defer().reprocess_with(|v: i64, _| Ok(v * 2));
    let probe = source.probe();
    let delegate = ScriptedLoader::new();
    let loader = ChainLoader::with_delegate(source, delegate_of(&delegate), sched.clone());
    let rec = RecordingListener::new();
    loader.register_listener(rec.clone());
    loader.start_loading();
    assert!(wait_until(|| loader.phase() == Phase::LoadingChain));

    delegate.deliver(&LoadResult::success(1));
    rec.wait_for(1, WAIT);
    assert!(sched.wait_idle(WAIT));
    assert_eq!(loader.phase(), Phase::LoadingSelf);

    // A polling delegate completes again; the hook still sees it.
    delegate.deliver(&LoadResult::success(2));
    let got = rec.wait_for(2, WAIT);
    assert!(sched.wait_idle(WAIT));
    let values: Vec<i64> = got.iter().map(|r| *r.get().unwrap()).collect();
    assert_eq!(values, vec![2, 4]);
    assert_eq!(probe.reprocessed().len(), 2);
    assert_eq!(probe.releases(), 1);
}

#[test]
fn force_load_reenters_the_chain() {
    let sched = scheduler(2);
    let delegate = ScriptedLoader::new();
    let loader = ChainLoader::with_delegate(
        ScriptedSource::<i64>::defer(),
        delegate_of(&delegate),
        sched.clone(),
    );
    let rec = RecordingListener::new();
    loader.register_listener(rec.clone());
    loader.start_loading();
    assert!(wait_until(|| loader.phase() == Phase::LoadingChain));
    delegate.deliver(&LoadResult::success(1));
    rec.wait_for(1, WAIT);
    assert!(sched.wait_idle(WAIT));

    loader.force_load();
    assert!(wait_until(|| delegate.force_loads() == 1));
    assert!(sched.wait_idle(WAIT));
    delegate.deliver(&LoadResult::success(2));
    let got = rec.wait_for(2, WAIT);
    assert_eq!(*got[1].get().unwrap(), 2);
}

#[test]
fn abandoned_attempt_reruns_on_restart() {
    let sched = scheduler(1);
    let gate = Gate::new();
    let source = ScriptedSource::value(1_i64).gated(&gate);
    let probe = source.probe();
    let loader = ChainLoader::new(source, sched.clone());
    let rec = RecordingListener::new();
    loader.register_listener(rec.clone());
    loader.start_loading();
    assert!(gate.await_arrivals(1, WAIT));

    loader.abandon();
    gate.open();
    assert!(sched.wait_idle(WAIT));
    assert!(rec.is_empty());
    assert_eq!(loader.phase(), Phase::Initialized);

    loader.start_loading();
    assert!(!loader.is_abandoned());
    let got = rec.wait_for(1, WAIT);
    assert!(sched.wait_idle(WAIT));
    assert_eq!(got.len(), 1);
    assert_eq!(*got[0].get().unwrap(), 1);
    assert_eq!(probe.attempts(), 2);
    assert_eq!(probe.cancels(), 1);
}

#[test]
fn restart_after_abandoning_a_finished_cycle_reuses_the_cache() {
    let sched = scheduler(2);
    let source = ScriptedSource::value(6_i64);
    let probe = source.probe();
    let loader = ChainLoader::new(source, sched.clone());
    let rec = RecordingListener::new();
    loader.register_listener(rec.clone());
    loader.start_loading();
    rec.wait_for(1, WAIT);
    assert!(sched.wait_idle(WAIT));

    loader.abandon();
    loader.abandon();
    loader.start_loading();
    let got = rec.wait_for(2, WAIT);
    assert!(sched.wait_idle(WAIT));
    assert_eq!(got.len(), 2);
    assert_eq!(*got[1].get().unwrap(), 6);
    assert_eq!(probe.attempts(), 1);
}

#[test]
fn ten_chains_keep_their_own_order_on_two_workers() {
    let mut rng = XorShift64::new(0x0C4A_1D5E);
    let sched = scheduler(2);
    let mut lines = Vec::new();
    let mut serial = Duration::ZERO;
    for _ in 0..10 {
        let pause = Duration::from_millis(rng.gen_range(10, 40));
        let source = ScriptedSource::<i64>::defer().reprocess_delay(pause);
        let probe = source.probe();
        let delegate = ScriptedLoader::new();
        let loader = ChainLoader::with_delegate(source, delegate_of(&delegate), sched.clone());
        let rec = RecordingListener::new();
        loader.register_listener(rec.clone());
        loader.start_loading();
        let steps = usize::try_from(rng.gen_range(4, 9)).unwrap();
        serial += pause * u32::try_from(steps).unwrap();
        let gaps: Vec<Duration> = (0..steps)
            .map(|_| Duration::from_millis(rng.gen_range(0, 8)))
            .collect();
        lines.push((loader, delegate, rec, probe, gaps));
    }
    for (loader, ..) in &lines {
        assert!(wait_until(|| loader.phase() == Phase::LoadingChain));
    }

    let started = Instant::now();
    thread::scope(|scope| {
        for (_, delegate, _, _, gaps) in &lines {
            scope.spawn(move || {
                for (step, gap) in gaps.iter().enumerate() {
                    thread::sleep(*gap);
                    let value = i64::try_from(step).unwrap();
                    if step + 1 == gaps.len() {
                        delegate.deliver(&LoadResult::success(value));
                    } else {
                        delegate.deliver(&LoadResult::partial(value));
                    }
                }
            });
        }
    });

    for (_, _, rec, probe, gaps) in &lines {
        let got = rec.wait_for(gaps.len(), WAIT);
        let values: Vec<i64> = got.iter().map(|r| *r.get().unwrap()).collect();
        let expected: Vec<i64> = (0..i64::try_from(gaps.len()).unwrap()).collect();
        assert_eq!(values, expected);
        assert!(got.last().unwrap().is_complete());
        assert_eq!(probe.max_reprocess_overlap(), 1);
    }
    assert!(sched.wait_idle(WAIT));
    let elapsed = started.elapsed();
    // Two workers: roughly half the serial reprocessing time.
    assert!(
        elapsed < serial.mul_f64(0.8),
        "elapsed {elapsed:?} vs serial {serial:?}"
    );
}
