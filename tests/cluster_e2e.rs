//! E2E: remote calls, pipelined handles, refcounting, and failure
//! delivery across a live localhost cluster.

mod common;

use plexus::{Fault, ProcId, Runtime, Value};
use std::sync::atomic::{AtomicUsize, Ordering};

fn int_arg(args: &[Value], index: usize) -> i64 {
    args.get(index).and_then(Value::as_int).unwrap_or(0)
}

fn proc_arg(args: &[Value], index: usize) -> ProcId {
    ProcId::new(u32::try_from(int_arg(args, index)).unwrap_or(0))
}

static BUMPS: AtomicUsize = AtomicUsize::new(0);

/// Registered on every process; the cluster is peer-symmetric.
fn setup(rt: &Runtime) {
    rt.register_fn("add_one", |args| Ok(Value::Int(int_arg(&args, 0) + 1)));
    rt.register_fn("square", |args| {
        let n = int_arg(&args, 0);
        Ok(Value::Int(n * n))
    });
    rt.register_fn("bump", |_args| {
        BUMPS.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Unit)
    });
    rt.register("boom", |ctx, _args| async move {
        Err(Fault::new(ctx.self_id(), "boom", "boom"))
    });
    rt.register("panics", |_ctx, _args| async move {
        assert_eq!(6 * 7, 41, "kaboom");
        Ok(Value::Unit)
    });
    rt.register("slow_square", |ctx, args| async move {
        // Stays runnable across many scheduler turns so callers really
        // suspend on it.
        for _ in 0..25 {
            ctx.yield_now().await;
        }
        let n = int_arg(&args, 0);
        Ok(Value::Int(n * n))
    });
    rt.register("plus_fetch", |ctx, args| async move {
        let Some(Value::Ref(upstream)) = args.first().cloned() else {
            return Err(Fault::new(ctx.self_id(), "plus_fetch", "expected a handle"));
        };
        let addend = int_arg(&args, 1);
        let value = ctx.fetch(&upstream).await;
        match value.as_int() {
            Some(n) => Ok(Value::Int(n + addend)),
            None => Err(Fault::new(
                ctx.self_id(),
                "plus_fetch",
                format!("non-numeric upstream value: {value}"),
            )),
        }
    });
    rt.register("clients_of", |ctx, args| async move {
        let origin = proc_arg(&args, 0);
        let seq = u64::try_from(int_arg(&args, 1)).unwrap_or(0);
        match ctx.item_clients(origin, seq) {
            Some(clients) => Ok(Value::List(
                clients
                    .into_iter()
                    .map(|p| Value::Int(i64::from(p.raw())))
                    .collect(),
            )),
            None => Ok(Value::Unit),
        }
    });
    rt.register("s1_driver", |ctx, _args| async move {
        let r = ctx
            .remote_call(ProcId::new(2), "add_one", vec![Value::Int(41)])
            .map_err(|e| Fault::new(ctx.self_id(), "s1_driver", e.to_string()))?;
        let id = r.id();
        let value = ctx.fetch(&r).await;
        drop(r);
        // The del_client travels ahead of this probe on the same
        // connection, so the owner has already reclaimed the item.
        let probe = ctx
            .remote_call(
                ProcId::new(2),
                "clients_of",
                vec![
                    Value::Int(i64::from(id.origin.raw())),
                    Value::Int(i64::try_from(id.seq).unwrap_or(0)),
                ],
            )
            .map_err(|e| Fault::new(ctx.self_id(), "s1_driver", e.to_string()))?;
        let reclaimed = ctx.fetch(&probe).await;
        Ok(Value::List(vec![value, reclaimed]))
    });
    rt.register("fetch_and_probe", |ctx, args| async move {
        let Some(Value::Ref(upstream)) = args.first().cloned() else {
            return Err(Fault::new(ctx.self_id(), "fetch_and_probe", "expected a handle"));
        };
        let value = ctx.fetch(&upstream).await;
        let probe = ctx
            .remote_call(
                upstream.id().owner,
                "clients_of",
                vec![args[1].clone(), args[2].clone()],
            )
            .map_err(|e| Fault::new(ctx.self_id(), "fetch_and_probe", e.to_string()))?;
        let clients = ctx.fetch(&probe).await;
        Ok(Value::List(vec![value, clients]))
    });
    rt.register("s3_driver", |ctx, _args| async move {
        let me = ctx.self_id();
        let r = ctx
            .remote_call(ProcId::new(2), "add_one", vec![Value::Int(41)])
            .map_err(|e| Fault::new(me, "s3_driver", e.to_string()))?;
        let id = r.id();
        let origin_arg = Value::Int(i64::from(id.origin.raw()));
        let seq_arg = Value::Int(i64::try_from(id.seq).unwrap_or(0));
        let forwarded = ctx
            .remote_call(
                ProcId::new(3),
                "fetch_and_probe",
                vec![Value::Ref(r.clone()), origin_arg.clone(), seq_arg.clone()],
            )
            .map_err(|e| Fault::new(me, "s3_driver", e.to_string()))?;
        let observed = ctx.fetch(&forwarded).await;
        drop(forwarded);
        drop(r);
        // Both holders are gone; the owner's entry converges to absent.
        for _ in 0..100 {
            let probe = ctx
                .remote_call(
                    ProcId::new(2),
                    "clients_of",
                    vec![origin_arg.clone(), seq_arg.clone()],
                )
                .map_err(|e| Fault::new(me, "s3_driver", e.to_string()))?;
            if ctx.fetch(&probe).await == Value::Unit {
                return Ok(observed);
            }
            ctx.yield_now().await;
        }
        Err(Fault::new(me, "s3_driver", "owner never reclaimed the item"))
    });
}

#[test]
fn s1_remote_call_fetch_and_reclaim() {
    let cluster = common::start(2, setup);
    let out = cluster
        .rt
        .block_on(|ctx| async move {
            let driver = ctx
                .remote_call(ProcId::new(1), "s1_driver", vec![])
                .expect("submit driver");
            ctx.fetch(&driver).await
        })
        .expect("block_on");
    assert_eq!(out, Value::List(vec![Value::Int(42), Value::Unit]));
    cluster.shutdown();
}

#[test]
fn s2_round_robin_squares() {
    let cluster = common::start(3, setup);
    let out = cluster
        .rt
        .block_on(|ctx| async move {
            let inputs = [10i64, 20, 30];
            let handles: Vec<_> = inputs
                .iter()
                .enumerate()
                .map(|(i, x)| {
                    let target = ProcId::new(u32::try_from(i % 3).unwrap() + 1);
                    ctx.remote_call(target, "square", vec![Value::Int(*x)])
                        .expect("submit square")
                })
                .collect();
            let mut results = Vec::new();
            for handle in &handles {
                results.push(ctx.fetch(handle).await);
            }
            Value::List(results)
        })
        .expect("block_on");
    assert_eq!(
        out,
        Value::List(vec![Value::Int(100), Value::Int(400), Value::Int(900)])
    );
    cluster.shutdown();
}

#[test]
fn s3_forwarded_handle_and_client_set() {
    let cluster = common::start(3, setup);
    let out = cluster
        .rt
        .block_on(|ctx| async move {
            let driver = ctx
                .remote_call(ProcId::new(1), "s3_driver", vec![])
                .expect("submit driver");
            ctx.fetch(&driver).await
        })
        .expect("block_on");
    // The third process saw the forwarded value, and while both handles
    // were live the owner counted exactly the two holders.
    assert_eq!(
        out,
        Value::List(vec![
            Value::Int(42),
            Value::List(vec![Value::Int(1), Value::Int(3)]),
        ])
    );
    cluster.shutdown();
}

#[test]
fn s4_failure_arrives_as_value() {
    let cluster = common::start(2, setup);
    let out = cluster
        .rt
        .block_on(|ctx| async move {
            let r = ctx
                .remote_call(ProcId::new(2), "boom", vec![])
                .expect("submit boom");
            ctx.fetch(&r).await
        })
        .expect("block_on");
    match out {
        Value::Fault(fault) => {
            assert_eq!(fault.computation, "boom");
            assert_eq!(fault.origin, ProcId::new(2));
        }
        other => panic!("expected a fault, got {other:?}"),
    }
    cluster.shutdown();
}

#[test]
fn s4_panic_is_caught_and_delivered() {
    let cluster = common::start(1, setup);
    let out = cluster
        .rt
        .block_on(|ctx| async move {
            let r = ctx
                .remote_call(ProcId::new(1), "panics", vec![])
                .expect("submit panics");
            ctx.fetch(&r).await
        })
        .expect("block_on");
    match out {
        Value::Fault(fault) => {
            assert_eq!(fault.computation, "panics");
            assert!(fault.message.contains("kaboom"), "message: {}", fault.message);
        }
        other => panic!("expected a fault, got {other:?}"),
    }
    cluster.shutdown();
}

#[test]
fn s5_suspended_task_does_not_block_its_process() {
    let cluster = common::start(2, setup);
    let out = cluster
        .rt
        .block_on(|ctx| async move {
            let slow = ctx
                .remote_call(ProcId::new(2), "slow_square", vec![Value::Int(7)])
                .expect("submit slow");
            // Suspends on `slow` inside process 1...
            let dependent = ctx
                .remote_call(
                    ProcId::new(1),
                    "plus_fetch",
                    vec![Value::Ref(slow.clone()), Value::Int(1)],
                )
                .expect("submit dependent");
            // ...which must still serve unrelated work meanwhile.
            let quick = ctx
                .remote_call(ProcId::new(1), "add_one", vec![Value::Int(0)])
                .expect("submit quick");
            let quick_value = ctx.fetch(&quick).await;
            let dependent_value = ctx.fetch(&dependent).await;
            Value::List(vec![quick_value, dependent_value])
        })
        .expect("block_on");
    assert_eq!(out, Value::List(vec![Value::Int(1), Value::Int(50)]));
    cluster.shutdown();
}

#[test]
fn sync_resolves_to_the_same_handle() {
    let cluster = common::start(2, setup);
    cluster
        .rt
        .block_on(|ctx| async move {
            let r = ctx
                .remote_call(ProcId::new(2), "add_one", vec![Value::Int(1)])
                .expect("submit");
            let synced = ctx.sync(&r).await;
            assert_eq!(synced, r);
            let value = ctx.fetch(&r).await;
            assert_eq!(value, Value::Int(2));
            Value::Unit
        })
        .expect("block_on");
    cluster.shutdown();
}

#[test]
fn remote_do_runs_without_a_handle() {
    let cluster = common::start(1, setup);
    cluster
        .rt
        .block_on(|ctx| async move {
            for _ in 0..3 {
                ctx.remote_do(ProcId::new(1), "bump", vec![]).expect("do");
            }
            // The bumps travel ahead of this call on the same
            // connection, so by the time it answers they have run.
            let fence = ctx
                .remote_call(ProcId::new(1), "add_one", vec![Value::Int(0)])
                .expect("submit fence");
            ctx.fetch(&fence).await
        })
        .expect("block_on");
    assert_eq!(BUMPS.load(Ordering::SeqCst), 3);
    cluster.shutdown();
}

#[test]
fn unknown_computation_faults_instead_of_hanging() {
    let cluster = common::start(1, setup);
    let out = cluster
        .rt
        .block_on(|ctx| async move {
            let r = ctx
                .remote_call(ProcId::new(1), "no_such_op", vec![])
                .expect("submit");
            ctx.fetch(&r).await
        })
        .expect("block_on");
    match out {
        Value::Fault(fault) => assert_eq!(fault.computation, "no_such_op"),
        other => panic!("expected a fault, got {other:?}"),
    }
    cluster.shutdown();
}
