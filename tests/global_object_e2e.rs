//! E2E: global object construction and replication (one instance per
//! process, shared cycle of weak peer-table entries).

mod common;

use plexus::{Fault, ProcId, Runtime, Value};

fn setup(rt: &Runtime) {
    rt.register("global_probe", |ctx, args| async move {
        let Some(Value::Global(global)) = args.first().cloned() else {
            return Err(Fault::new(ctx.self_id(), "global_probe", "expected a global object"));
        };
        // Report which instance this process resolved the argument to.
        let home = global.home_id();
        Ok(Value::List(vec![
            Value::Int(i64::from(home.origin.raw())),
            Value::Int(i64::try_from(home.seq).unwrap_or(0)),
            Value::Int(i64::try_from(global.peer_count()).unwrap_or(0)),
        ]))
    });
}

#[test]
fn s6_construction_and_replication() {
    let cluster = common::start(2, setup);
    cluster
        .rt
        .block_on(|ctx| async move {
            let global = ctx.make_global().await.expect("global construction");

            // Every process appears in the peer table, and the local
            // instance is reachable through this process's own entry.
            assert!(global.is_bound());
            assert_eq!(global.peer_count(), 3);
            assert_eq!(global.peer_id(ctx.self_id()), Some(global.home_id()));

            // The creation protocol seeds every process into the local
            // instance's client set: the known-topology cycle.
            let own = global.home_id();
            let clients = ctx
                .item_clients(own.origin, own.seq)
                .expect("own instance registered");
            assert!(clients.contains(&ProcId::new(1)));
            assert!(clients.contains(&ProcId::new(2)));

            // Serializing to a peer resolves to that peer's own local
            // instance.
            let expected = global.peer_id(ProcId::new(1)).expect("peer entry");
            let probe = ctx
                .remote_call(
                    ProcId::new(1),
                    "global_probe",
                    vec![Value::Global(global.clone())],
                )
                .expect("submit probe");
            let first = ctx.fetch(&probe).await;
            assert_eq!(
                first,
                Value::List(vec![
                    Value::Int(i64::from(expected.origin.raw())),
                    Value::Int(i64::try_from(expected.seq).unwrap_or(0)),
                    Value::Int(3),
                ])
            );

            // A destination that already holds the object gets only the
            // peer-table entry again; nothing changes.
            let probe_again = ctx
                .remote_call(
                    ProcId::new(1),
                    "global_probe",
                    vec![Value::Global(global.clone())],
                )
                .expect("submit second probe");
            let second = ctx.fetch(&probe_again).await;
            assert_eq!(second, first);

            let clients_after = ctx
                .item_clients(own.origin, own.seq)
                .expect("own instance still registered");
            assert_eq!(clients_after, clients);

            Value::Unit
        })
        .expect("block_on");
    cluster.shutdown();
}

#[test]
fn global_object_equality_is_per_process_identity() {
    let cluster = common::start(1, setup);
    cluster
        .rt
        .block_on(|ctx| async move {
            let global = ctx.make_global().await.expect("global construction");
            let clone = global.clone();
            assert_eq!(global, clone);
            assert_eq!(global.home_id(), clone.home_id());
            Value::Unit
        })
        .expect("block_on");
    cluster.shutdown();
}
