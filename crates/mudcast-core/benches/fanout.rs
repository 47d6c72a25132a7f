//! Fan-out benchmarks for mudcast-core.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mudcast_core::{
    BroadcastRouter, Channel, ChannelMessage, DeliveryError, EntityId, MemoryAttributes, Receiver,
    ReceiverRef, SendContext, Transition, WatchEngine, WatchSpec,
};
use std::sync::Arc;

struct Sink {
    id: EntityId,
}

impl Receiver for Sink {
    fn id(&self) -> &EntityId {
        &self.id
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn msg(&self, text: &str) -> Result<(), DeliveryError> {
        black_box(text);
        Ok(())
    }
}

fn sinks(count: usize) -> Vec<ReceiverRef> {
    (0..count)
        .map(|i| {
            Arc::new(Sink {
                id: EntityId::new(format!("player{i}")),
            }) as ReceiverRef
        })
        .collect()
}

fn bench_route(c: &mut Criterion) {
    let mut group = c.benchmark_group("route");
    let router = BroadcastRouter::new();

    for count in [10, 100, 1000] {
        let receivers = sinks(count);
        let mut channel = Channel::new("Public");
        for r in &receivers {
            channel.subscribe(r);
        }
        // Mute every tenth subscriber.
        for r in receivers.iter().step_by(10) {
            channel.mute(r.id());
        }

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &channel, |b, channel| {
            b.iter(|| {
                router.route(
                    ChannelMessage::new("hello everyone"),
                    black_box(channel),
                    &SendContext::new().with_sender("player0"),
                )
            })
        });
    }

    group.finish();
}

fn bench_notify(c: &mut Criterion) {
    let mut group = c.benchmark_group("notify");

    for count in [10, 100, 1000] {
        let observers = sinks(count);
        let store = Arc::new(MemoryAttributes::new());
        for r in observers.iter().step_by(2) {
            WatchSpec::update(&store, r.id(), |w| w.watch_all = true).unwrap();
        }
        let engine = WatchEngine::new(store);
        engine.start();
        let subject = Sink {
            id: EntityId::new("newcomer"),
        };

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &observers, |b, observers| {
            b.iter(|| engine.notify(&subject, Transition::Connect, black_box(observers)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_route, bench_notify);
criterion_main!(benches);
