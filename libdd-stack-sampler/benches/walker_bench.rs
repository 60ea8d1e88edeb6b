// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use criterion::{BenchmarkId, Criterion, Throughput};
use libdd_stack_sampler::thread::fake::{FakeThread, FakeThreadControl};
use libdd_stack_sampler::thread::RegisterState;
use libdd_stack_sampler::{
    backtrace, enumerate_backtraces_for_all_threads, Backtrace, FrameAbi, StackBounds,
    ThreadControl, ThreadMetadataCache,
};
use std::hint::black_box;

const STACK_LOW: usize = 0x10_0000;
const FRAME_STRIDE: usize = 0x40;

fn process_with_depth(threads: u64, depth: usize) -> FakeThreadControl {
    let control = FakeThreadControl::new(1);
    for tid in 2..2 + threads {
        let low = STACK_LOW * tid as usize;
        let fp = low + 0x100;
        let mut thread = FakeThread::new(tid, &format!("worker-{tid}"));
        thread.stack = StackBounds::new(low, low + FRAME_STRIDE * (depth + 8));
        thread.registers = RegisterState {
            pc: 0x5000,
            lr: None,
            fp,
            sp: low,
        };
        control.add_thread(thread);
        let returns: Vec<usize> = (0..depth).map(|i| 0x4000 + i * 0x10).collect();
        control.write_chain(fp, FRAME_STRIDE, &returns);
    }
    control
}

pub fn benchmark_walk(c: &mut Criterion) {
    let mut group = c.benchmark_group("walker/backtrace");
    for depth in [8usize, 32, 127] {
        let control = process_with_depth(1, depth);
        let target = control.threads().unwrap_or_default()[0];
        let calling = control.current_thread();
        let bounds = StackBounds::new(2 * STACK_LOW, 2 * STACK_LOW + FRAME_STRIDE * (depth + 8));
        let mut out = [0usize; 128];
        // The fake only hands out registers of a suspended thread.
        if control.suspend(&target).is_err() {
            continue;
        }
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| {
                black_box(backtrace(
                    &control,
                    &target,
                    &calling,
                    bounds,
                    FrameAbi::plain(),
                    0,
                    black_box(&mut out),
                ))
            })
        });
        let _ = control.resume(&target);
    }
    group.finish();
}

pub fn benchmark_enumeration(c: &mut Criterion) {
    let mut group = c.benchmark_group("walker/enumerate_all_threads");
    for threads in [1u64, 16, 64] {
        let control = process_with_depth(threads, 32);
        let mut cache = ThreadMetadataCache::new("dd.");
        group.throughput(Throughput::Elements(threads));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, _| {
            b.iter(|| {
                let mut collected = 0usize;
                let mut sink = |bt: Backtrace| collected += bt.addresses.len();
                let summary = enumerate_backtraces_for_all_threads(
                    &control,
                    &mut cache,
                    FrameAbi::plain(),
                    128,
                    &mut sink,
                );
                black_box((summary.is_ok(), collected))
            })
        });
    }
    group.finish();
}
