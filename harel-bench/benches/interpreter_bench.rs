//! Interpreter run-loop benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use harel_core::{Implementations, Machine, MachineDefinition};
use harel_runtime::{CallbackHandle, Interpreter, Services, SimulatedClock};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn counter() -> Machine {
    let raw = json!({
        "id": "counter",
        "initial": "active",
        "context": {"count": 0},
        "states": {
            "active": {"on": {"INC": {
                "internal": true,
                "actions": [{"type": "assign", "assignment": {"count": {"expr": "inc"}}}, "tick"]
            }}}
        }
    });
    Machine::new(MachineDefinition::from_value(&raw).unwrap()).with_implementations(
        Implementations::new()
            .expr("inc", |ctx, _| Ok(json!(ctx["count"].as_i64().unwrap_or(0) + 1)))
            .action("tick", |_, _| {}),
    )
}

fn bench_send(c: &mut Criterion) {
    let mut group = c.benchmark_group("interpreter_send");
    group.throughput(Throughput::Elements(1));

    let interpreter = Interpreter::new(counter());
    interpreter.start().unwrap();
    group.bench_function("assign_and_exec", |b| b.iter(|| interpreter.send(black_box("INC"))));
    interpreter.stop();

    let interpreter = Interpreter::new(counter());
    interpreter.start().unwrap();
    for listeners in 0..8 {
        interpreter.subscribe(move |state| {
            black_box((listeners, &state.context));
        });
    }
    group.bench_function("with_8_listeners", |b| b.iter(|| interpreter.send(black_box("INC"))));
    interpreter.stop();

    group.finish();
}

fn bench_concurrent_senders(c: &mut Criterion) {
    let mut group = c.benchmark_group("interpreter_concurrent");

    for threads in [2usize, 8] {
        let per_thread = 1000usize;
        group.throughput(Throughput::Elements((threads * per_thread) as u64));
        group.bench_with_input(BenchmarkId::new("threads", threads), &threads, |b, &threads| {
            b.iter(|| {
                let interpreter = Interpreter::new(counter());
                interpreter.start().unwrap();
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let interpreter = interpreter.clone();
                        std::thread::spawn(move || {
                            for _ in 0..per_thread {
                                interpreter.send("INC");
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
                interpreter.stop();
            })
        });
    }

    group.finish();
}

fn bench_invocations(c: &mut Criterion) {
    let mut group = c.benchmark_group("interpreter_invoke");

    let parent = Machine::new(
        MachineDefinition::from_value(&json!({
            "id": "parent",
            "initial": "idle",
            "states": {
                "idle": {"on": {"GO": "working"}},
                "working": {
                    "invoke": {"id": "worker", "src": "worker"},
                    "on": {"BACK": "idle"}
                }
            }
        }))
        .unwrap(),
    );

    // Starting and disposing a callback service per round trip.
    let services = Services::new().callback("worker", |_, _, _| Ok(CallbackHandle::new().on_dispose(|| {})));
    let interpreter = Interpreter::new(parent.clone())
        .with_services(services)
        .with_clock(Arc::new(SimulatedClock::new()));
    interpreter.start().unwrap();
    group.bench_function("callback_start_stop", |b| {
        b.iter(|| {
            interpreter.send("GO");
            interpreter.send("BACK");
        })
    });
    interpreter.stop();

    let rt = Runtime::new().unwrap();
    let services = Services::new().task("worker", |_, _| async { Ok(serde_json::Value::Null) });
    group.bench_function("task_start_cancel", |b| {
        let _guard = rt.enter();
        let interpreter = Interpreter::new(parent.clone()).with_services(services.clone());
        interpreter.start().unwrap();
        b.iter(|| {
            interpreter.send("GO");
            interpreter.send("BACK");
        });
        interpreter.stop();
    });

    group.finish();
}

fn bench_delayed(c: &mut Criterion) {
    let mut group = c.benchmark_group("interpreter_delayed");

    let m = Machine::new(
        MachineDefinition::from_value(&json!({
            "id": "blinker",
            "initial": "on",
            "states": {
                "on": {"after": {"10": "off"}},
                "off": {"after": {"10": "on"}}
            }
        }))
        .unwrap(),
    );
    let clock = Arc::new(SimulatedClock::new());
    let interpreter = Interpreter::new(m).with_clock(clock.clone());
    interpreter.start().unwrap();
    group.bench_function("fire_after", |b| b.iter(|| clock.advance(Duration::from_millis(10))));
    interpreter.stop();

    group.finish();
}

criterion_group!(
    benches,
    bench_send,
    bench_concurrent_senders,
    bench_invocations,
    bench_delayed,
);

criterion_main!(benches);
