// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::backtrace::{enumerate_backtraces_for_all_threads, Backtrace};
use super::metadata_cache::ThreadMetadataCache;
use crate::shared::configuration::SamplerConfiguration;
use crate::shared::constants::SAMPLER_THREAD_NAME;
use crate::thread::ThreadControl;
use portable_atomic::AtomicU64;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Relaxed, SeqCst};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub type BoxedSink = Box<dyn FnMut(Backtrace) + Send>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SamplerState {
    Idle,
    Running,
    Stopped,
    Aborted,
}

impl SamplerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Aborted)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    #[error("Sampler cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        from: SamplerState,
        to: SamplerState,
    },
    #[error("Failed to spawn the sampling thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Default)]
struct SamplerStats {
    ticks: AtomicU64,
    samples: AtomicU64,
    dropped: AtomicU64,
    failed_passes: AtomicU64,
}

/// Snapshot of the sampler's diagnostic counters.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SamplerCounters {
    pub ticks: u64,
    pub samples: u64,
    pub dropped: u64,
    pub failed_passes: u64,
}

struct Running {
    stop: mpsc::Sender<()>,
    aborted: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Samples every thread of the process at a fixed interval from a dedicated background thread.
///
/// Dropping a running sampler stops it.
pub struct SamplingProfiler {
    config: SamplerConfiguration,
    control: Arc<dyn ThreadControl>,
    sink: Option<BoxedSink>,
    state: SamplerState,
    running: Option<Running>,
    stats: Arc<SamplerStats>,
}

/// Deadline of the tick following one due at `previous`.
///
/// A tick late by at most `leeway` keeps its slot, even if that means running immediately. If the
/// pass overran further, the missed slots are dropped rather than run back to back.
pub fn next_deadline(
    previous: Instant,
    now: Instant,
    interval: Duration,
    leeway: Duration,
) -> Instant {
    let next = previous + interval;
    if now <= next + leeway {
        return next;
    }
    let behind = (now - next).as_nanos();
    let phase = behind % interval.as_nanos().max(1);
    now + interval - Duration::from_nanos(phase as u64)
}

impl SamplingProfiler {
    pub fn new<S>(config: SamplerConfiguration, control: Arc<dyn ThreadControl>, sink: S) -> Self
    where
        S: FnMut(Backtrace) + Send + 'static,
    {
        Self {
            config,
            control,
            sink: Some(Box::new(sink)),
            state: SamplerState::Idle,
            running: None,
            stats: Arc::new(SamplerStats::default()),
        }
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    pub fn counters(&self) -> SamplerCounters {
        SamplerCounters {
            ticks: self.stats.ticks.load(Relaxed),
            samples: self.stats.samples.load(Relaxed),
            dropped: self.stats.dropped.load(Relaxed),
            failed_passes: self.stats.failed_passes.load(Relaxed),
        }
    }

    pub fn start(&mut self) -> Result<(), SamplerError> {
        let invalid = SamplerError::InvalidTransition {
            from: self.state,
            to: SamplerState::Running,
        };
        if self.state != SamplerState::Idle {
            return Err(invalid);
        }
        let Some(mut sink) = self.sink.take() else {
            return Err(invalid);
        };

        let (stop_tx, stop_rx) = mpsc::channel();
        let aborted = Arc::new(AtomicBool::new(false));
        let control = self.control.clone();
        let config = self.config.clone();
        let stats = self.stats.clone();
        let task_aborted = aborted.clone();

        let handle = std::thread::Builder::new()
            .name(SAMPLER_THREAD_NAME.to_string())
            .spawn(move || {
                let mut forward = |backtrace: Backtrace| {
                    if !task_aborted.load(SeqCst) {
                        sink(backtrace)
                    }
                };
                sampling_loop(&*control, &config, &stats, &stop_rx, &mut forward);
            })?;

        tracing::debug!(
            interval = ?self.config.interval(),
            leeway = ?self.config.leeway(),
            "Started sampling profiler"
        );
        self.running = Some(Running {
            stop: stop_tx,
            aborted,
            handle,
        });
        self.state = SamplerState::Running;
        Ok(())
    }

    /// Stops sampling. A pass in progress completes and its backtraces are delivered.
    pub fn stop(&mut self) -> Result<(), SamplerError> {
        self.finish(SamplerState::Stopped)
    }

    /// Stops sampling and discards whatever the pass in progress still produces.
    pub fn abort(&mut self) -> Result<(), SamplerError> {
        self.finish(SamplerState::Aborted)
    }

    fn finish(&mut self, to: SamplerState) -> Result<(), SamplerError> {
        if self.state.is_terminal() {
            return Err(SamplerError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        if let Some(running) = self.running.take() {
            if to == SamplerState::Aborted {
                running.aborted.store(true, SeqCst);
            }
            // Wakes the loop; it exits on either a message or a disconnect.
            let _ = running.stop.send(());
            drop(running.stop);
            // A sink may stop the sampler from the sampling thread itself; that thread exits on
            // its own once the pass returns.
            let on_sampling_thread = running.handle.thread().id() == std::thread::current().id();
            if !on_sampling_thread && running.handle.join().is_err() {
                tracing::error!("Sampling thread panicked");
            }
        }
        tracing::debug!(state = ?to, counters = ?self.counters(), "Sampling profiler finished");
        Ok(())
    }
}

impl Drop for SamplingProfiler {
    fn drop(&mut self) {
        if self.state == SamplerState::Running {
            let _ = self.stop();
        }
    }
}

fn sampling_loop(
    control: &dyn ThreadControl,
    config: &SamplerConfiguration,
    stats: &SamplerStats,
    stop: &mpsc::Receiver<()>,
    sink: &mut dyn FnMut(Backtrace),
) {
    // Session scoped: metadata of threads that exit is dropped with the session.
    let mut cache = ThreadMetadataCache::new(config.reserved_thread_prefix());
    let mut deadline = Instant::now() + config.interval();
    loop {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match stop.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        stats.ticks.fetch_add(1, Relaxed);
        match enumerate_backtraces_for_all_threads(
            control,
            &mut cache,
            config.frame_abi(),
            config.max_depth(),
            sink,
        ) {
            Ok(summary) => {
                stats.samples.fetch_add(summary.samples as u64, Relaxed);
                stats.dropped.fetch_add(summary.dropped as u64, Relaxed);
            }
            Err(error) => {
                stats.failed_passes.fetch_add(1, Relaxed);
                tracing::debug!(%error, "Sampling pass failed");
            }
        }

        deadline = next_deadline(deadline, Instant::now(), config.interval(), config.leeway());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::configuration::FrameAbi;
    use crate::thread::fake::{FakeThread, FakeThreadControl};
    use crate::thread::{RegisterState, StackBounds};

    fn fake_process() -> Arc<FakeThreadControl> {
        let control = FakeThreadControl::new(1);
        let mut thread = FakeThread::new(2, "worker");
        thread.stack = StackBounds::new(0x10000, 0x20000);
        thread.registers = RegisterState {
            pc: 0x5000,
            lr: None,
            fp: 0x10100,
            sp: 0x10000,
        };
        control.add_thread(thread);
        control.write_chain(0x10100, 0x40, &[0x4010, 0x4020]);
        Arc::new(control)
    }

    fn config() -> SamplerConfiguration {
        SamplerConfiguration::new(Duration::from_millis(2), Duration::from_millis(1), 128, None)
            .unwrap()
            .with_frame_abi(FrameAbi::plain())
    }

    #[test]
    fn test_next_deadline() {
        let ms = Duration::from_millis;
        let start = Instant::now();
        // On time, or late within the leeway: keep the slot.
        assert_eq!(next_deadline(start, start + ms(3), ms(10), ms(1)), start + ms(10));
        assert_eq!(next_deadline(start, start + ms(11), ms(10), ms(1)), start + ms(10));
        // Overran by 2.5 intervals: the next slot in phase, never one in the past.
        let next = next_deadline(start, start + ms(35), ms(10), ms(1));
        assert_eq!(next, start + ms(40));
        assert!(next > start + ms(35));
    }

    #[test]
    fn test_start_stop() -> anyhow::Result<()> {
        let control = fake_process();
        let (tx, rx) = mpsc::channel();
        let mut sampler = SamplingProfiler::new(config(), control.clone(), move |bt| {
            let _ = tx.send(bt);
        });
        assert_eq!(sampler.state(), SamplerState::Idle);
        sampler.start()?;
        assert_eq!(sampler.state(), SamplerState::Running);
        assert!(sampler.start().is_err());

        let first = rx.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(first.metadata.thread_id, 2);
        assert_eq!(first.addresses, vec![0x4fff, 0x400f, 0x401f]);
        let _ = rx.recv_timeout(Duration::from_secs(5))?;

        sampler.stop()?;
        assert_eq!(sampler.state(), SamplerState::Stopped);
        let counters = sampler.counters();
        assert!(counters.ticks >= 2);
        assert!(counters.samples >= 2);
        assert_eq!(control.suspend_count(), control.resume_count());

        assert!(matches!(
            sampler.start(),
            Err(SamplerError::InvalidTransition {
                from: SamplerState::Stopped,
                to: SamplerState::Running
            })
        ));
        assert!(sampler.abort().is_err());
        Ok(())
    }

    #[test]
    fn test_abort_discards_and_stops_ticking() -> anyhow::Result<()> {
        let control = fake_process();
        let (tx, rx) = mpsc::channel();
        let mut sampler = SamplingProfiler::new(config(), control, move |bt| {
            let _ = tx.send(bt);
        });
        sampler.start()?;
        let _ = rx.recv_timeout(Duration::from_secs(5))?;
        sampler.abort()?;
        assert_eq!(sampler.state(), SamplerState::Aborted);
        let ticks = sampler.counters().ticks;
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(sampler.counters().ticks, ticks);
        // The sender went away with the sampling thread.
        while rx.try_recv().is_ok() {}
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::TryRecvError::Disconnected)
        ));
        Ok(())
    }

    #[test]
    fn test_stop_before_start() -> anyhow::Result<()> {
        let mut sampler = SamplingProfiler::new(config(), fake_process(), |_| {});
        sampler.stop()?;
        assert_eq!(sampler.state(), SamplerState::Stopped);
        assert!(sampler.start().is_err());
        Ok(())
    }

    #[test]
    fn test_failed_passes_are_counted() -> anyhow::Result<()> {
        let control = fake_process();
        control.set_fail_enumeration(true);
        let mut sampler = SamplingProfiler::new(config(), control, |_| {});
        sampler.start()?;
        let deadline = Instant::now() + Duration::from_secs(5);
        while sampler.counters().failed_passes == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        sampler.stop()?;
        let counters = sampler.counters();
        assert!(counters.failed_passes >= 1);
        assert_eq!(counters.samples, 0);
        Ok(())
    }
}
