// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Frame-pointer stack walking.
//!
//! Note that the walk of a foreign thread runs while that thread is suspended. It must not
//! allocate, take locks or log through `tracing`: the suspended thread may hold any of those.
//! Every memory access goes through [`MemoryReader`], so a corrupt frame chain ends the walk
//! instead of faulting.

use super::metadata_cache::{ThreadMetadata, ThreadMetadataCache};
use crate::shared::configuration::{AsyncFrameAbi, FrameAbi};
use crate::shared::constants::MAX_BACKTRACE_FRAMES;
use crate::shared::log::{async_safe_log, LogLevel};
use crate::thread::registers::{frame_address, previous_instruction};
use crate::thread::{MemoryReader, StackBounds, ThreadControl, ThreadControlError, ThreadHandle};

const WORD: usize = std::mem::size_of::<usize>();

// Bits 63:60 of a saved FP: 0b0001 marks an async extended frame record.
#[cfg(target_pointer_width = "64")]
const ASYNC_FRAME_TAG_SHIFT: u32 = 60;
#[cfg(target_pointer_width = "64")]
const ASYNC_FRAME_TAG_MASK: usize = 0xf << ASYNC_FRAME_TAG_SHIFT;

/// Outcome of one stack walk.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Walk {
    /// Number of addresses written to the output buffer.
    pub depth: usize,
    /// True only if the walk ended at the outermost frame. A walk that stopped on the depth cap or
    /// on an unreadable frame leaves this false.
    pub reached_end_of_stack: bool,
}

/// A sampled stack. The engine never keeps these; they are handed to the sink by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backtrace {
    pub metadata: ThreadMetadata,
    /// Return addresses, innermost first.
    pub addresses: Vec<usize>,
}

/// Receives every forwarded backtrace.
pub trait BacktraceSink {
    fn on_backtrace(&mut self, backtrace: Backtrace);
}

impl<F: FnMut(Backtrace) + ?Sized> BacktraceSink for F {
    fn on_backtrace(&mut self, backtrace: Backtrace) {
        (*self)(backtrace)
    }
}

/// Fills the output buffer, honouring `skip` before counting toward the cap.
struct FrameWriter<'a> {
    out: &'a mut [usize],
    depth: usize,
    skip: usize,
}

impl FrameWriter<'_> {
    #[inline]
    fn is_full(&self) -> bool {
        self.depth >= self.out.len()
    }

    #[inline]
    fn push(&mut self, addr: usize) {
        if self.skip > 0 {
            self.skip -= 1;
        } else if let Some(slot) = self.out.get_mut(self.depth) {
            *slot = addr;
            self.depth += 1;
        }
    }
}

/// A frame record `[saved_fp, return_addr]` fits in the stack and is aligned.
#[inline]
fn is_valid_record(bounds: &StackBounds, fp: usize) -> bool {
    bounds.is_valid_frame(fp) && fp.checked_add(2 * WORD).is_some_and(|end| end <= bounds.high)
}

#[inline]
fn is_aligned(addr: usize) -> bool {
    addr % WORD == 0
}

#[cfg(target_pointer_width = "64")]
#[inline]
fn is_async_frame(abi: &FrameAbi, saved_fp: usize) -> bool {
    abi.async_frames == AsyncFrameAbi::ExtendedFrameRecord
        && (saved_fp >> ASYNC_FRAME_TAG_SHIFT) == 1
}

#[cfg(not(target_pointer_width = "64"))]
#[inline]
fn is_async_frame(_abi: &FrameAbi, _saved_fp: usize) -> bool {
    false
}

#[cfg(target_pointer_width = "64")]
#[inline]
fn decode_frame_pointer(abi: &FrameAbi, saved_fp: usize) -> usize {
    if abi.async_frames == AsyncFrameAbi::ExtendedFrameRecord {
        abi.strip(saved_fp & !ASYNC_FRAME_TAG_MASK)
    } else {
        abi.strip(saved_fp)
    }
}

#[cfg(not(target_pointer_width = "64"))]
#[inline]
fn decode_frame_pointer(abi: &FrameAbi, saved_fp: usize) -> usize {
    abi.strip(saved_fp)
}

/// Follows the async context list hanging off an extended frame record at `fp`, appending each
/// resume address. The context pointer is stored in the word right below the saved FP; each
/// context starts with `[parent_context, resume_address]`.
fn walk_async_contexts(
    memory: &dyn MemoryReader,
    bounds: &StackBounds,
    abi: &FrameAbi,
    fp: usize,
    frames: &mut FrameWriter<'_>,
) {
    let Some(slot) = fp.checked_sub(WORD).filter(|slot| bounds.contains(*slot)) else {
        return;
    };
    let Some(mut context) = memory.read_word(slot).map(|ctx| abi.strip(ctx)) else {
        return;
    };
    while !frames.is_full() {
        if context == 0 || !is_aligned(context) {
            break;
        }
        let Some(parent) = memory.read_word(context) else {
            break;
        };
        let Some(resume) = context
            .checked_add(WORD)
            .and_then(|addr| memory.read_word(addr))
        else {
            break;
        };
        let resume = abi.strip(resume);
        if resume == 0 {
            break;
        }
        frames.push(resume);
        context = abi.strip(parent);
    }
}

/// Walks the stack of `target` into `out`, innermost frame first.
///
/// `target` must be suspended unless it is `calling`. `bounds` must describe the stack `target`
/// is currently running on. At most `min(out.len(), MAX_BACKTRACE_FRAMES)` addresses are written;
/// the first `skip` frames are discarded without counting toward that limit.
///
/// Frame 0 is the program counter and, on architectures with a link register, frame 1 is the link
/// register when it passes the frame checks. The rest come from the frame record chain. Every
/// address except async resume addresses is moved back by one byte so that it points into the
/// call instruction.
#[inline(never)]
pub fn backtrace<C: ThreadControl + ?Sized>(
    control: &C,
    target: &ThreadHandle,
    calling: &ThreadHandle,
    bounds: StackBounds,
    abi: FrameAbi,
    skip: usize,
    out: &mut [usize],
) -> Walk {
    let max_depth = out.len().min(MAX_BACKTRACE_FRAMES);
    if max_depth == 0 || !bounds.is_valid() {
        return Walk::default();
    }
    let registers = match control.register_state(target) {
        Ok(registers) => registers,
        Err(_) => {
            async_safe_log!(LogLevel::Error, "Failed to fill thread state of {}", target.tid());
            return Walk::default();
        }
    };
    let memory = control.memory();
    let mut frames = FrameWriter {
        out: &mut out[..max_depth],
        depth: 0,
        skip,
    };

    frames.push(previous_instruction(registers.pc));
    if let Some(lr) = registers.lr {
        if !frames.is_full() && bounds.is_valid_frame(lr) {
            frames.push(previous_instruction(abi.strip(lr)));
        }
    }

    let mut current = if calling == target {
        frame_address()
    } else {
        registers.fp
    };
    // The thread may have been stopped in a prologue or epilogue; nothing sensible can be done
    // without unwind tables.
    if !is_valid_record(&bounds, current) {
        return Walk::default();
    }

    let mut reached_end_of_stack = false;
    while !frames.is_full() {
        let Some(saved_fp) = memory.read_word(current) else {
            break;
        };
        let Some(return_addr) = memory.read_word(current + WORD) else {
            break;
        };
        if is_async_frame(&abi, saved_fp) {
            walk_async_contexts(memory, &bounds, &abi, current, &mut frames);
            if frames.is_full() {
                break;
            }
        }
        let next = decode_frame_pointer(&abi, saved_fp);
        frames.push(previous_instruction(abi.strip(return_addr)));
        if next > current && is_valid_record(&bounds, next) {
            current = next;
        } else {
            reached_end_of_stack = true;
            break;
        }
    }

    Walk {
        depth: frames.depth,
        reached_end_of_stack,
    }
}

/// Walks the calling thread without suspending anything.
#[inline(never)]
pub fn capture_current_thread<C: ThreadControl + ?Sized>(
    control: &C,
    abi: FrameAbi,
    skip: usize,
    out: &mut [usize],
) -> Walk {
    let current = control.current_thread();
    let bounds = control.current_stack_bounds();
    backtrace(control, &current, &current, bounds, abi, skip, out)
}

/// Resumes the thread when dropped, whatever path leaves the walk.
struct SuspendGuard<'a, C: ThreadControl + ?Sized> {
    control: &'a C,
    thread: &'a ThreadHandle,
}

impl<'a, C: ThreadControl + ?Sized> SuspendGuard<'a, C> {
    fn new(control: &'a C, thread: &'a ThreadHandle) -> Result<Self, ThreadControlError> {
        control.suspend(thread)?;
        Ok(Self { control, thread })
    }
}

impl<C: ThreadControl + ?Sized> Drop for SuspendGuard<'_, C> {
    fn drop(&mut self) {
        if self.control.resume(self.thread).is_err() {
            async_safe_log!(LogLevel::Error, "Failed to resume thread {}", self.thread.tid());
        }
    }
}

/// Counters for one sampling pass.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Backtraces handed to the sink, idle threads included.
    pub samples: usize,
    /// Threads that were looked at but produced no backtrace.
    pub dropped: usize,
}

/// Samples every thread of the process except the calling one.
///
/// Idle threads produce an empty backtrace with priority -1 without being suspended. Threads whose
/// metadata has id 0 are skipped. Other threads are suspended one at a time, walked into a fixed
/// buffer, and resumed; only complete walks reach the sink.
pub fn enumerate_backtraces_for_all_threads<C, S>(
    control: &C,
    cache: &mut ThreadMetadataCache,
    abi: FrameAbi,
    max_depth: usize,
    sink: &mut S,
) -> Result<PassSummary, ThreadControlError>
where
    C: ThreadControl + ?Sized,
    S: BacktraceSink + ?Sized,
{
    let current = control.current_thread();
    let max_depth = max_depth.min(MAX_BACKTRACE_FRAMES);
    let mut summary = PassSummary::default();

    for thread in control.threads()? {
        if thread.tid() == current.tid() {
            continue;
        }

        if control.is_idle(&thread) {
            sink.on_backtrace(Backtrace {
                metadata: ThreadMetadata {
                    thread_id: thread.tid(),
                    name: None,
                    priority: -1,
                },
                addresses: Vec::new(),
            });
            summary.samples += 1;
            continue;
        }

        let metadata = cache.metadata_for_thread(control, &thread);
        if metadata.thread_id == 0 {
            continue;
        }

        // May read files and allocate, so it has to happen before suspension.
        let regions = match control.stack_regions(&thread) {
            Ok(regions) => regions,
            Err(error) => {
                tracing::debug!(tid = thread.tid(), %error, "No stack regions for thread");
                summary.dropped += 1;
                continue;
            }
        };

        let mut addresses = [0usize; MAX_BACKTRACE_FRAMES];
        let walk = {
            let _suspended = match SuspendGuard::new(control, &thread) {
                Ok(guard) => guard,
                Err(error) => {
                    tracing::debug!(tid = thread.tid(), %error, "Unable to suspend thread");
                    summary.dropped += 1;
                    continue;
                }
            };
            let bounds = control
                .register_state(&thread)
                .map_or(StackBounds::INVALID, |registers| {
                    regions.resolve(registers.sp)
                });
            backtrace(
                control,
                &thread,
                &current,
                bounds,
                abi,
                0,
                &mut addresses[..max_depth],
            )
        };

        if walk.reached_end_of_stack {
            sink.on_backtrace(Backtrace {
                metadata,
                addresses: addresses[..walk.depth].to_vec(),
            });
            summary.samples += 1;
        } else {
            summary.dropped += 1;
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::fake::{FakeThread, FakeThreadControl};
    use crate::thread::RegisterState;

    const STACK: StackBounds = StackBounds::new(0x10000, 0x20000);
    const FIRST_FP: usize = 0x10100;
    const STRIDE: usize = 0x40;
    const RETURNS: [usize; 5] = [0x4010, 0x4020, 0x4030, 0x4040, 0x4050];

    fn process_with_chain(returns: &[usize]) -> (FakeThreadControl, ThreadHandle) {
        let control = FakeThreadControl::new(1);
        let mut thread = FakeThread::new(2, "worker");
        thread.stack = STACK;
        thread.registers = RegisterState {
            pc: 0x5000,
            lr: None,
            fp: FIRST_FP,
            sp: FIRST_FP - 0x20,
        };
        let handle = control.add_thread(thread);
        control.write_chain(FIRST_FP, STRIDE, returns);
        (control, handle)
    }

    fn walk(
        control: &FakeThreadControl,
        target: &ThreadHandle,
        bounds: StackBounds,
        abi: FrameAbi,
        skip: usize,
        out: &mut [usize],
    ) -> Walk {
        control.suspend(target).unwrap();
        let calling = control.current_thread();
        let walk = backtrace(control, target, &calling, bounds, abi, skip, out);
        control.resume(target).unwrap();
        walk
    }

    #[test]
    fn test_walks_plain_chain() {
        let (control, thread) = process_with_chain(&RETURNS);
        let mut out = [0usize; MAX_BACKTRACE_FRAMES];
        let result = walk(&control, &thread, STACK, FrameAbi::plain(), 0, &mut out);
        assert_eq!(
            result,
            Walk {
                depth: 6,
                reached_end_of_stack: true
            }
        );
        assert_eq!(
            &out[..6],
            &[0x4fff, 0x400f, 0x401f, 0x402f, 0x403f, 0x404f]
        );
    }

    #[test]
    fn test_skip_discards_innermost_frames() {
        let (control, thread) = process_with_chain(&RETURNS);
        let mut full = [0usize; MAX_BACKTRACE_FRAMES];
        let full_walk = walk(&control, &thread, STACK, FrameAbi::plain(), 0, &mut full);
        for skip in 0..=full_walk.depth + 1 {
            let mut out = [0usize; MAX_BACKTRACE_FRAMES];
            let result = walk(&control, &thread, STACK, FrameAbi::plain(), skip, &mut out);
            let expected = full_walk.depth.saturating_sub(skip);
            assert_eq!(result.depth, expected);
            assert_eq!(&out[..expected], &full[skip.min(full_walk.depth)..full_walk.depth]);
            assert!(result.reached_end_of_stack);
        }
    }

    #[test]
    fn test_respects_max_depth() {
        let (control, thread) = process_with_chain(&RETURNS);
        let mut out = [0usize; 4];
        out[3] = 0x8bad_f00d;
        let result = walk(&control, &thread, STACK, FrameAbi::plain(), 0, &mut out[..3]);
        assert_eq!(
            result,
            Walk {
                depth: 3,
                reached_end_of_stack: false
            }
        );
        assert_eq!(out[3], 0x8bad_f00d);

        let result = walk(&control, &thread, STACK, FrameAbi::plain(), 0, &mut out[..0]);
        assert_eq!(result, Walk::default());
    }

    #[test]
    fn test_skip_does_not_count_toward_cap() {
        let (control, thread) = process_with_chain(&RETURNS);
        let mut out = [0usize; 2];
        let result = walk(&control, &thread, STACK, FrameAbi::plain(), 3, &mut out);
        assert_eq!(result.depth, 2);
        assert_eq!(out, [0x402f, 0x403f]);
    }

    #[test]
    fn test_invalid_start_frame_or_bounds() {
        let (control, thread) = process_with_chain(&RETURNS);
        let mut out = [0usize; 8];
        assert_eq!(
            walk(&control, &thread, StackBounds::INVALID, FrameAbi::plain(), 0, &mut out),
            Walk::default()
        );
        assert_eq!(
            walk(
                &control,
                &thread,
                StackBounds::new(0x30000, 0x40000),
                FrameAbi::plain(),
                0,
                &mut out
            ),
            Walk::default()
        );

        let mut misaligned = FakeThread::new(3, "misaligned");
        misaligned.stack = STACK;
        misaligned.registers = RegisterState {
            pc: 0x5000,
            lr: None,
            fp: FIRST_FP + 3,
            sp: FIRST_FP,
        };
        let misaligned = control.add_thread(misaligned);
        assert_eq!(
            walk(&control, &misaligned, STACK, FrameAbi::plain(), 0, &mut out),
            Walk::default()
        );
    }

    #[test]
    fn test_registers_unavailable() {
        let (control, thread) = process_with_chain(&RETURNS);
        let mut out = [0usize; 8];
        let calling = control.current_thread();
        // Not suspended.
        let result = backtrace(&control, &thread, &calling, STACK, FrameAbi::plain(), 0, &mut out);
        assert_eq!(result, Walk::default());
    }

    #[test]
    fn test_unreadable_frame_is_not_end_of_stack() {
        let (control, thread) = process_with_chain(&RETURNS);
        // The last record points just past the mapped stack, into a range the bounds still allow.
        let last = FIRST_FP + STRIDE * (RETURNS.len() - 1);
        control.write_frame(last, STACK.high + 0x100, 0x4050);
        let wide = StackBounds::new(STACK.low, STACK.high + 0x1000);
        let mut out = [0usize; 16];
        let result = walk(&control, &thread, wide, FrameAbi::plain(), 0, &mut out);
        assert_eq!(
            result,
            Walk {
                depth: 6,
                reached_end_of_stack: false
            }
        );
    }

    #[test]
    fn test_non_increasing_frame_ends_walk() {
        let (control, thread) = process_with_chain(&RETURNS);
        // Second record loops back to the first.
        control.write_frame(FIRST_FP + STRIDE, FIRST_FP, 0x4020);
        let mut out = [0usize; 16];
        let result = walk(&control, &thread, STACK, FrameAbi::plain(), 0, &mut out);
        assert_eq!(
            result,
            Walk {
                depth: 3,
                reached_end_of_stack: true
            }
        );
    }

    #[test]
    fn test_link_register_frame() {
        let (control, _) = process_with_chain(&RETURNS);
        let mut thread = FakeThread::new(4, "lr");
        thread.stack = STACK;
        thread.registers = RegisterState {
            pc: 0x5000,
            lr: Some(0x10808),
            fp: FIRST_FP,
            sp: FIRST_FP,
        };
        let thread = control.add_thread(thread);
        let mut out = [0usize; 16];
        let result = walk(&control, &thread, STACK, FrameAbi::plain(), 0, &mut out);
        assert_eq!(result.depth, 7);
        assert_eq!(&out[..2], &[0x4fff, 0x10807]);

        // An LR outside the stack bounds is not reported.
        let mut other = FakeThread::new(5, "lr-out");
        other.stack = STACK;
        other.registers = RegisterState {
            pc: 0x5000,
            lr: Some(0x6000),
            fp: FIRST_FP,
            sp: FIRST_FP,
        };
        let other = control.add_thread(other);
        let result = walk(&control, &other, STACK, FrameAbi::plain(), 0, &mut out);
        assert_eq!(result.depth, 6);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_async_extended_frames() {
        const CONTEXTS: StackBounds = StackBounds::new(0x90000, 0x91000);
        let (control, thread) = process_with_chain(&RETURNS);
        control.fake_memory().map(CONTEXTS);
        // Make the second record an extended one.
        let extended = FIRST_FP + STRIDE;
        control.write_frame(extended, (extended + STRIDE) | (1 << 60), 0x4020);
        control.fake_memory().write(extended - WORD, 0x90100);
        control.fake_memory().write(0x90100, 0x90200);
        control.fake_memory().write(0x90108, 0x7100);
        control.fake_memory().write(0x90200, 0);
        control.fake_memory().write(0x90208, 0x7200);

        let abi = FrameAbi {
            async_frames: AsyncFrameAbi::ExtendedFrameRecord,
            pointer_mask: usize::MAX >> 17,
        };
        let mut out = [0usize; 16];
        let result = walk(&control, &thread, STACK, abi, 0, &mut out);
        assert!(result.reached_end_of_stack);
        assert_eq!(
            &out[..result.depth],
            &[0x4fff, 0x400f, 0x7100, 0x7200, 0x401f, 0x402f, 0x403f, 0x404f]
        );

        // Without the ABI the tagged pointer is out of bounds and ends the walk.
        let result = walk(&control, &thread, STACK, FrameAbi::plain(), 0, &mut out);
        assert_eq!(
            result,
            Walk {
                depth: 3,
                reached_end_of_stack: true
            }
        );

        // The async frames count toward the cap.
        let mut small = [0usize; 3];
        let result = walk(&control, &thread, STACK, abi, 0, &mut small);
        assert_eq!(small, [0x4fff, 0x400f, 0x7100]);
        assert!(!result.reached_end_of_stack);
    }

    #[test]
    fn test_walker_reads_stay_in_bounds() {
        use bolero::generator::TypeGenerator;

        const LOW: usize = 0x10000;
        let words = Vec::<usize>::produce().with().len(4usize..64);
        bolero::check!()
            .with_generator((words, 0usize..512, 0usize..4))
            .for_each(|(words, fp_offset, skip)| {
                let span = words.len() * WORD;
                let bounds = StackBounds::new(LOW, LOW + span);
                let control = FakeThreadControl::new(1);
                let mut thread = FakeThread::new(2, "fuzz");
                // Map more than the bounds so that out-of-bounds reads would succeed.
                thread.stack = StackBounds::new(LOW - 0x1000, LOW + span + 0x1000);
                thread.registers = RegisterState {
                    pc: 0x5000,
                    lr: Some(words[0]),
                    fp: LOW + fp_offset,
                    sp: LOW,
                };
                let thread = control.add_thread(thread);
                for (i, word) in words.iter().enumerate() {
                    // Keep about half of the saved words pointing into the stack.
                    let value = if word % 2 == 0 {
                        LOW + word % (span + 16)
                    } else {
                        *word
                    };
                    control.fake_memory().write(LOW + i * WORD, value);
                }
                control.fake_memory().reset_stats();

                let mut out = [0usize; MAX_BACKTRACE_FRAMES];
                let result = walk(&control, &thread, bounds, FrameAbi::plain(), *skip, &mut out);
                assert!(result.depth <= MAX_BACKTRACE_FRAMES);
                if let Some((min, max)) = control.fake_memory().read_range() {
                    assert!(bounds.contains(min), "read below bounds at {min:#x}");
                    assert!(bounds.contains(max), "read above bounds at {max:#x}");
                }
                if !is_valid_record(&bounds, LOW + fp_offset) {
                    assert_eq!(result, Walk::default());
                }
            });
    }

    fn busy_process() -> FakeThreadControl {
        let (control, _) = process_with_chain(&RETURNS);
        let mut idle = FakeThread::new(3, "idle");
        idle.idle = true;
        control.add_thread(idle);
        control.add_thread(FakeThread::new(4, "dd.internal"));
        let mut stuck = FakeThread::new(5, "stuck");
        stuck.fail_suspend = true;
        control.add_thread(stuck);
        // The calling thread itself is never sampled.
        control.add_thread(FakeThread::new(1, "sampler"));
        control
    }

    #[test]
    fn test_enumerate_all_threads() -> anyhow::Result<()> {
        let control = busy_process();
        let mut cache = ThreadMetadataCache::new("dd.");
        let mut samples = Vec::new();
        let summary = enumerate_backtraces_for_all_threads(
            &control,
            &mut cache,
            FrameAbi::plain(),
            MAX_BACKTRACE_FRAMES,
            &mut |bt: Backtrace| samples.push(bt),
        )?;
        assert_eq!(
            summary,
            PassSummary {
                samples: 2,
                dropped: 1
            }
        );
        assert_eq!(samples.len(), 2);
        let worker = samples
            .iter()
            .find(|bt| bt.metadata.thread_id == 2)
            .ok_or_else(|| anyhow::anyhow!("worker missing"))?;
        assert_eq!(worker.metadata.name.as_deref(), Some("worker"));
        assert_eq!(worker.addresses.len(), 6);
        let idle = samples
            .iter()
            .find(|bt| bt.metadata.thread_id == 3)
            .ok_or_else(|| anyhow::anyhow!("idle missing"))?;
        assert_eq!(idle.metadata.priority, -1);
        assert!(idle.addresses.is_empty());
        assert!(samples.iter().all(|bt| bt.metadata.thread_id != 1));
        assert!(samples.iter().all(|bt| bt.metadata.thread_id != 4));
        // Every suspension was paired with a resume.
        assert_eq!(control.suspend_count(), control.resume_count());
        assert!(!control.is_suspended(2));
        Ok(())
    }

    #[test]
    fn test_incomplete_walks_are_not_forwarded() -> anyhow::Result<()> {
        let (control, _) = process_with_chain(&RETURNS);
        let mut cache = ThreadMetadataCache::new("dd.");
        let mut samples = Vec::new();
        let summary = enumerate_backtraces_for_all_threads(
            &control,
            &mut cache,
            FrameAbi::plain(),
            3,
            &mut |bt: Backtrace| samples.push(bt),
        )?;
        assert!(samples.is_empty());
        assert_eq!(summary.dropped, 1);
        assert_eq!(control.suspend_count(), 1);
        assert_eq!(control.resume_count(), 1);
        Ok(())
    }

    #[test]
    fn test_enumeration_failure() {
        let control = busy_process();
        control.set_fail_enumeration(true);
        let mut cache = ThreadMetadataCache::new("dd.");
        let result = enumerate_backtraces_for_all_threads(
            &control,
            &mut cache,
            FrameAbi::plain(),
            MAX_BACKTRACE_FRAMES,
            &mut |_: Backtrace| panic!("no samples expected"),
        );
        assert!(result.is_err());
    }
}
