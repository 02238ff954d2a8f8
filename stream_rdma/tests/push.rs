/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::sync::Arc;
use std::time::Duration;

use stream_rdma::DataPlaneError;
use stream_rdma::DataPlaneParams;
use stream_rdma::HostBuffer;
use stream_rdma::PreloadMode;
use stream_rdma::ReadRequest;
use stream_rdma::imm::PushTag;
use stream_rdma::push::PushPhase;
use stream_rdma::test_utils::LoopbackCohort;
use stream_rdma::test_utils::step_pattern;

const STEP_LEN: usize = 64;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Ranges reader `reader` takes from every writer each step.
fn ranges(reader: usize) -> [(u64, u64); 2] {
    [(reader as u64 * 16, 16), (32 + reader as u64 * 8, 8)]
}

fn expected(writer: usize, sequence: i64, (offset, length): (u64, u64)) -> Vec<u8> {
    step_pattern(writer, sequence, STEP_LEN)[offset as usize..(offset + length) as usize].to_vec()
}

/// Reads step 0 with the fixed pattern and locks on it.
fn locked_cohort(writers: usize, readers: usize) -> anyhow::Result<LoopbackCohort> {
    let cohort = LoopbackCohort::new(writers, readers, &DataPlaneParams::default())?;
    let handles = cohort.publish(0, STEP_LEN)?;
    for reader in 0..readers {
        for writer in 0..writers {
            for range in ranges(reader) {
                let got = cohort.read(
                    reader,
                    ReadRequest::new(writer, 0, range.0, range.1),
                    &handles[writer],
                )?;
                assert_eq!(got, expected(writer, 0, range));
            }
        }
    }
    cohort.lock_pattern(0)?;
    cohort.release(0)?;
    Ok(cohort)
}

#[test]
fn test_locked_pattern_is_pushed() -> anyhow::Result<()> {
    init_logging();
    let cohort = locked_cohort(2, 2)?;
    for wsr in &cohort.wsrs {
        assert_eq!(wsr.phase(), Some(PushPhase::SelectionPulled));
    }
    assert!(cohort.readers.iter().all(|r| r.is_preloading()));

    cohort.fabric.clear_posted_writes();
    let handles = cohort.publish(1, STEP_LEN)?;
    let writes = cohort.fabric.posted_writes();
    // Two writers, two readers, two ranges each.
    assert_eq!(writes.len(), 8);
    for write in &writes {
        let tag = PushTag::decode(write.imm.expect("pushes carry immediate data"));
        assert_eq!(tag.slot, 1);
        assert!(tag.index < 2);
    }
    for wsr in &cohort.wsrs {
        assert_eq!(wsr.phase(), Some(PushPhase::Preloading));
        assert!(wsr.preload_used(1));
        assert!(!wsr.preload_used(0));
    }

    for reader in 0..2 {
        for writer in 0..2 {
            for range in ranges(reader) {
                let buffer = Arc::new(HostBuffer::zeroed(range.1 as usize));
                let completion = cohort.readers[reader].read_remote_memory(
                    ReadRequest::new(writer, 1, range.0, range.1),
                    buffer.clone(),
                    &handles[writer],
                )?;
                assert!(completion.is_preloaded());
                completion.wait()?;
                assert_eq!(buffer.to_vec(), expected(writer, 1, range));
            }
        }
    }
    cohort.release(1)?;
    cohort.destroy()?;
    assert_eq!(cohort.fabric.live_registrations(), 0);
    Ok(())
}

#[test]
fn test_consumer_waits_for_push() -> anyhow::Result<()> {
    init_logging();
    let cohort = locked_cohort(2, 2)?;
    cohort.fabric.set_manual_progress(true);
    let handles = cohort.publish(2, STEP_LEN)?;
    assert_eq!(cohort.fabric.pending_operations(), 8);

    let range = ranges(1)[0];
    let buffer = Arc::new(HostBuffer::zeroed(range.1 as usize));
    let completion = cohort.readers[1].read_remote_memory(
        ReadRequest::new(0, 2, range.0, range.1),
        buffer.clone(),
        &handles[0],
    )?;
    assert!(completion.is_preloaded());
    assert!(!completion.is_complete());
    assert!(buffer.to_vec().iter().all(|b| *b == 0));

    cohort.fabric.progress_all();
    completion.wait()?;
    assert_eq!(buffer.to_vec(), expected(0, 2, range));

    cohort.fabric.set_manual_progress(false);
    cohort.release(2)?;
    cohort.destroy()?;
    Ok(())
}

#[test]
fn test_push_ahead_of_consumer() -> anyhow::Result<()> {
    init_logging();
    let cohort = locked_cohort(2, 2)?;
    cohort.fabric.set_manual_progress(true);
    let handles = cohort.publish(3, STEP_LEN)?;
    cohort.fabric.progress_all();
    cohort.fabric.set_manual_progress(false);
    for reader in &cohort.readers {
        // Four pushes per reader land before anyone asks for them.
        assert_eq!(reader.progress()?, 4);
    }

    let range = ranges(0)[1];
    let buffer = Arc::new(HostBuffer::zeroed(range.1 as usize));
    let completion = cohort.readers[0].read_remote_memory(
        ReadRequest::new(1, 3, range.0, range.1),
        buffer.clone(),
        &handles[1],
    )?;
    assert!(completion.is_complete());
    assert_eq!(buffer.to_vec(), expected(1, 3, range));

    // A second read of the same range in the same step is pulled instead.
    let again = Arc::new(HostBuffer::zeroed(range.1 as usize));
    let completion = cohort.readers[0].read_remote_memory(
        ReadRequest::new(1, 3, range.0, range.1),
        again.clone(),
        &handles[1],
    )?;
    assert!(!completion.is_preloaded());
    completion.wait()?;
    assert_eq!(again.to_vec(), expected(1, 3, range));

    cohort.release(3)?;
    cohort.destroy()?;
    Ok(())
}

#[test]
fn test_unlogged_range_falls_back_to_pull() -> anyhow::Result<()> {
    init_logging();
    let cohort = locked_cohort(1, 1)?;
    let handles = cohort.publish(1, STEP_LEN)?;
    let range = (48, 12);
    let got = cohort.read(0, ReadRequest::new(0, 1, range.0, range.1), &handles[0])?;
    assert_eq!(got, expected(0, 1, range));
    cohort.release(1)?;
    cohort.destroy()?;
    Ok(())
}

#[test]
fn test_occupied_slot_defers_push() -> anyhow::Result<()> {
    init_logging();
    let cohort = locked_cohort(1, 1)?;
    let wsr = &cohort.wsrs[0];
    cohort.fabric.clear_posted_writes();

    let handles1 = cohort.publish(1, STEP_LEN)?;
    let handles2 = cohort.publish(2, STEP_LEN)?;
    let handles3 = cohort.publish(3, STEP_LEN)?;
    assert_eq!(wsr.deferred_timesteps(), vec![3]);
    assert!(wsr.preload_used(0) && wsr.preload_used(1));

    // Two ranges per step; nothing was written for step 3.
    let writes = cohort.fabric.posted_writes();
    assert_eq!(writes.len(), 4);
    let slots: Vec<usize> = writes
        .iter()
        .map(|w| PushTag::decode(w.imm.unwrap_or_default()).slot)
        .collect();
    assert_eq!(slots, vec![1, 1, 0, 0]);
    let stride = writes[0].remote_addr - writes[2].remote_addr;
    assert_eq!(stride, 24);

    // Step 1 is still intact in slot 1 while step 3 waits.
    for range in ranges(0) {
        let got = cohort.read(0, ReadRequest::new(0, 1, range.0, range.1), &handles1[0])?;
        assert_eq!(got, expected(0, 1, range));
    }
    cohort.release(1)?;
    assert!(wsr.deferred_timesteps().is_empty());
    let writes = cohort.fabric.posted_writes();
    assert_eq!(writes.len(), 6);
    assert_eq!(writes[4].remote_addr, writes[0].remote_addr);

    for (sequence, handles) in [(2, &handles2), (3, &handles3)] {
        for range in ranges(0) {
            let got = cohort.read(0, ReadRequest::new(0, sequence, range.0, range.1), &handles[0])?;
            assert_eq!(got, expected(0, sequence, range));
        }
        cohort.release(sequence)?;
    }
    cohort.destroy()?;
    assert_eq!(cohort.fabric.live_registrations(), 0);
    Ok(())
}

#[test]
fn test_steps_published_before_the_writer_learns_of_the_lock() -> anyhow::Result<()> {
    init_logging();
    let cohort = LoopbackCohort::new(1, 1, &DataPlaneParams::default())?;
    let handles = cohort.publish(0, STEP_LEN)?;
    let range = ranges(0)[0];
    cohort.read(0, ReadRequest::new(0, 0, range.0, range.1), &handles[0])?;
    cohort.readers[0].lock_pattern(0)?;
    assert!(matches!(
        cohort.readers[0].lock_pattern(0),
        Err(DataPlaneError::UsageViolation(_))
    ));

    cohort.fabric.clear_posted_writes();
    let handles = cohort.publish(1, STEP_LEN)?;
    let wsr = &cohort.wsrs[0];
    assert_eq!(wsr.phase(), Some(PushPhase::Unlocked));
    assert!(cohort.fabric.posted_writes().is_empty());

    wsr.reader_register_timestep(1, PreloadMode::On)?;
    wsr.read_pattern_locked(0)?;
    assert_eq!(wsr.phase(), Some(PushPhase::Preloading));
    assert_eq!(cohort.fabric.posted_writes().len(), 1);

    let buffer = Arc::new(HostBuffer::zeroed(range.1 as usize));
    let completion = cohort.readers[0].read_remote_memory(
        ReadRequest::new(0, 1, range.0, range.1),
        buffer.clone(),
        &handles[0],
    )?;
    assert!(completion.is_preloaded());
    completion.wait()?;
    assert_eq!(buffer.to_vec(), expected(0, 1, range));

    cohort.release(0)?;
    cohort.release(1)?;
    cohort.destroy()?;
    Ok(())
}

#[test]
fn test_conn_failure_wakes_preload_waiters() -> anyhow::Result<()> {
    init_logging();
    let cohort = locked_cohort(2, 1)?;
    cohort.fabric.set_manual_progress(true);
    let handles = cohort.publish(1, STEP_LEN)?;

    let range = ranges(0)[0];
    let buffer = Arc::new(HostBuffer::zeroed(range.1 as usize));
    let completion = cohort.readers[0].read_remote_memory(
        ReadRequest::new(1, 1, range.0, range.1),
        buffer.clone(),
        &handles[1],
    )?;
    cohort.readers[0].notify_conn_failure(1);
    let err = completion.wait().unwrap_err();
    assert!(matches!(err, DataPlaneError::PeerFailure { rank: 1 }), "{err:?}");

    cohort.fabric.progress_all();
    cohort.fabric.set_manual_progress(false);
    let got = cohort.read(0, ReadRequest::new(0, 1, range.0, range.1), &handles[0])?;
    assert_eq!(got, expected(0, 1, range));
    cohort.release(1)?;
    cohort.destroy()?;
    Ok(())
}

#[test]
fn test_release_waits_for_pushes_in_flight() -> anyhow::Result<()> {
    init_logging();
    let cohort = locked_cohort(1, 1)?;
    cohort.fabric.set_manual_progress(true);
    cohort.publish(1, STEP_LEN)?;
    assert_eq!(cohort.fabric.pending_operations(), 2);

    // The reader drops step 1 unread while both pushes are still queued.
    std::thread::scope(|scope| -> anyhow::Result<()> {
        let release = scope.spawn(|| cohort.readers[0].release_timestep(1));
        std::thread::sleep(Duration::from_millis(50));
        let returned_early = release.is_finished();
        assert_eq!(cohort.fabric.progress_all(), 2);
        release
            .join()
            .map_err(|_| anyhow::anyhow!("release panicked"))??;
        assert!(!returned_early);
        Ok(())
    })?;
    cohort.fabric.set_manual_progress(false);
    cohort.wsrs[0].release_timestep(1)?;
    cohort.writers[0].release_timestep(1)?;

    // Step 3 reuses slot 1 and must not see step 1's bytes.
    let handles3 = cohort.publish(3, STEP_LEN)?;
    for range in ranges(0) {
        let buffer = Arc::new(HostBuffer::zeroed(range.1 as usize));
        let completion = cohort.readers[0].read_remote_memory(
            ReadRequest::new(0, 3, range.0, range.1),
            buffer.clone(),
            &handles3[0],
        )?;
        assert!(completion.is_preloaded());
        completion.wait()?;
        assert_eq!(buffer.to_vec(), expected(0, 3, range));
    }
    cohort.release(3)?;
    cohort.destroy()?;
    assert_eq!(cohort.fabric.live_registrations(), 0);
    Ok(())
}
