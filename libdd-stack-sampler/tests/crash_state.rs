// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(target_os = "linux")]

use libdd_stack_sampler::crash::{EntryPoint, HookTable};
use libdd_stack_sampler::{
    AsyncChainConfiguration, AsyncChainInterceptor, LinuxThreadControl, ThreadControl,
    ThreadNameCache, ThreadNameCacheConfiguration, ThreadRef,
};
use std::sync::{mpsc, Arc};
use std::time::Duration;

#[test]
fn test_frozen_names_of_live_threads() -> anyhow::Result<()> {
    let control = Arc::new(LinuxThreadControl::new()?);
    let (tid_tx, tid_rx) = mpsc::channel();
    let (park_tx, park_rx) = mpsc::channel::<()>();
    let worker = {
        let control = control.clone();
        std::thread::Builder::new()
            .name("named-worker".to_string())
            .spawn(move || {
                let _ = tid_tx.send(control.current_thread().native());
                let _ = park_rx.recv();
            })?
    };
    let worker_ref = tid_rx.recv_timeout(Duration::from_secs(5))?;

    let cache = ThreadNameCache::new();
    cache.init(ThreadNameCacheConfiguration::default(), control.clone())?;
    cache.freeze();
    let mut buf = [0u8; 64];
    assert_eq!(cache.get_thread_name(worker_ref, &mut buf), Some("named-worker"));
    assert_eq!(cache.get_queue_name(worker_ref), None);
    cache.unfreeze();
    cache.close();
    assert_eq!(cache.live_snapshots(), 0);

    drop(park_tx);
    worker.join().map_err(|_| anyhow::anyhow!("worker panicked"))?;
    Ok(())
}

/// A single-threaded executor that schedules work through the hook table.
struct Executor {
    queue: mpsc::Sender<libdd_stack_sampler::crash::async_chain::Work>,
    hooks: Arc<HookTable>,
}

impl Executor {
    fn dispatch_async(&self, work: impl FnOnce() + Send + 'static) {
        let work = self.hooks.submit(EntryPoint::DispatchAsync, Box::new(work));
        let _ = self.queue.send(work);
    }
}

#[test]
fn test_async_chain_across_threads() -> anyhow::Result<()> {
    let control: Arc<dyn ThreadControl> = Arc::new(LinuxThreadControl::new()?);
    let interceptor = Arc::new(AsyncChainInterceptor::new(
        &AsyncChainConfiguration::default(),
        control.clone(),
    ));
    let hooks = Arc::new(HookTable::new());
    interceptor.install(&*hooks)?;

    let (queue, jobs) = mpsc::channel::<libdd_stack_sampler::crash::async_chain::Work>();
    let runner = std::thread::Builder::new()
        .name("executor".to_string())
        .spawn(move || {
            for job in jobs {
                job();
            }
        })?;
    let executor = Arc::new(Executor { queue, hooks });

    let (seen_tx, seen_rx) = mpsc::channel();
    {
        let interceptor = interceptor.clone();
        let executor_inner = executor.clone();
        let control = control.clone();
        executor.dispatch_async(move || {
            let me: ThreadRef = control.current_thread().native();
            let mut frames = [0usize; 256];
            let outer_frames = interceptor.with_async_caller_frames(me, &mut frames);
            let outer = interceptor.get_async_caller_for_thread(me);

            let interceptor = interceptor.clone();
            let control = control.clone();
            executor_inner.dispatch_async(move || {
                let me = control.current_thread().native();
                let inner = interceptor.get_async_caller_for_thread(me);
                let chained = inner.and_then(|node| interceptor.arena().caller(node));
                let _ = seen_tx.send((outer_frames, outer, inner, chained));
            });
        });
    }

    let (outer_frames, outer, inner, chained) = seen_rx.recv_timeout(Duration::from_secs(5))?;
    assert!(outer_frames.is_some());
    assert!(outer.is_some());
    assert!(inner.is_some());
    assert_ne!(inner, outer);
    assert_eq!(chained, outer);

    drop(executor);
    runner.join().map_err(|_| anyhow::anyhow!("executor panicked"))?;
    assert_eq!(interceptor.outstanding_nodes(), 0);
    Ok(())
}
