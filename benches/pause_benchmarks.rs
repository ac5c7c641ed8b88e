use criterion::{Criterion, criterion_group, criterion_main};
use stw_pause::test_utils::{MutatorBehavior, MutatorHarness};
use stw_pause::{PauseConfig, PauseDaemon, SyncStrategy};

fn bench_empty_pause(c: &mut Criterion) {
    let daemon = PauseDaemon::with_defaults(PauseConfig::default()).unwrap();
    daemon.execute_with(|| {}).unwrap();

    c.bench_function("empty_pause_no_mutators", |b| {
        b.iter(|| daemon.execute().unwrap());
    });
}

fn bench_pause_with_mutators(c: &mut Criterion) {
    for strategy in [SyncStrategy::CompareAndSwap, SyncStrategy::Polling] {
        let config = PauseConfig {
            strategy,
            ..PauseConfig::default()
        };
        let daemon = PauseDaemon::with_defaults(config).unwrap();
        let mut mutators = Vec::new();
        for id in 0..4 {
            let behavior = if id % 2 == 0 {
                MutatorBehavior::Native
            } else {
                MutatorBehavior::Spin
            };
            mutators.push(MutatorHarness::start(
                daemon.registry(),
                daemon.new_mutator(id),
                behavior,
            ));
        }
        daemon.execute_with(|| {}).unwrap();

        c.bench_function(&format!("pause_four_mutators_{strategy:?}"), |b| {
            b.iter(|| daemon.execute().unwrap());
        });

        for mutator in mutators {
            mutator.join();
        }
    }
}

criterion_group!(benches, bench_empty_pause, bench_pause_with_mutators);
criterion_main!(benches);
