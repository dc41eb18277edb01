//! Shared cluster harness for end-to-end tests.
//!
//! Each "process" is one runtime on its own OS thread (a runtime is
//! single-threaded and never leaves its thread). Workers bind ephemeral
//! localhost ports up front so the initiator knows the full location
//! table before anyone starts serving.

use plexus::{Location, Runtime, RuntimeConfig};
use std::net::TcpListener;
use std::sync::Once;
use std::thread::JoinHandle;

static TRACING: Once = Once::new();

/// A running cluster: the initiator runtime plus one serving thread per
/// worker.
pub struct Cluster {
    pub rt: Runtime,
    workers: Vec<JoinHandle<()>>,
}

/// Starts `nworkers` workers and an initiator, applying the same
/// `setup` (computation registration) on every process.
pub fn start(nworkers: usize, setup: fn(&Runtime)) -> Cluster {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
    let mut locations = vec![Location::new("127.0.0.1", 0)];
    let mut listeners = Vec::new();
    for _ in 0..nworkers {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind worker port");
        let port = listener.local_addr().expect("local addr").port();
        locations.push(Location::new("127.0.0.1", port));
        listeners.push(listener);
    }

    let workers = listeners
        .into_iter()
        .map(|listener| {
            std::thread::spawn(move || {
                let rt = Runtime::new(RuntimeConfig::default());
                setup(&rt);
                rt.serve(listener).expect("worker loop failed");
            })
        })
        .collect();

    let rt = Runtime::new(RuntimeConfig::default());
    setup(&rt);
    rt.bootstrap(locations).expect("cluster bootstrap failed");
    Cluster { rt, workers }
}

impl Cluster {
    /// Drops the initiator (workers observe EOF and exit) and joins the
    /// worker threads.
    pub fn shutdown(self) {
        let Cluster { rt, workers } = self;
        drop(rt);
        for worker in workers {
            worker.join().expect("worker thread panicked");
        }
    }
}
