//! Frame Scheduler Tests
//!
//! Tests for:
//! - Slot rotation: which fences are waited on as frames wrap around
//! - Retirement: references released, garbage collected, binding pools reset
//! - Secondary command buffers: execution order and recycling
//! - Fatal errors: a failed fence wait keeps the in-flight record
//! - Failed command buffer transitions: sync objects returned, slots retired
//! - Use after shutdown

use std::sync::Arc;

use sortie::core::device::Command;
use sortie::core::device::headless::HeadlessDevice;
use sortie::render::frame::{FrameScheduler, SlotState};
use sortie::{FrameSettings, ResourceManager, SortieError};

fn scheduler(n: u32) -> (Arc<HeadlessDevice>, ResourceManager, FrameScheduler) {
    let device = Arc::new(HeadlessDevice::new());
    let rm = ResourceManager::new(device.clone());
    let settings = FrameSettings {
        frames_in_flight: n,
        ..Default::default()
    };
    let sched = FrameScheduler::new(device.clone(), &settings).unwrap();
    (device, rm, sched)
}

fn run_frame(sched: &mut FrameScheduler, rm: &mut ResourceManager) {
    sched.begin_frame(rm).unwrap();
    sched.recording_buffer().draw_fullscreen();
    sched.submit_and_advance(None).unwrap();
}

// ============================================================================
// Rotation
// ============================================================================

#[test]
fn two_slots_wait_only_when_a_slot_comes_back() {
    let (device, mut rm, mut sched) = scheduler(2);

    run_frame(&mut sched, &mut rm);
    run_frame(&mut sched, &mut rm);
    assert!(device.fence_wait_log().is_empty());

    run_frame(&mut sched, &mut rm);
    run_frame(&mut sched, &mut rm);

    let submissions = device.submissions();
    assert_eq!(submissions.len(), 4);
    assert_eq!(
        device.fence_wait_log(),
        vec![submissions[0].fence, submissions[1].fence]
    );
    assert_eq!(sched.retire_count(0), 1);
    assert_eq!(sched.retire_count(1), 1);
    assert_eq!(sched.current_index(), 0);
}

#[test]
fn slot_index_follows_frame_number() {
    let (_device, mut rm, mut sched) = scheduler(3);
    for frame in 0..10u64 {
        assert_eq!(sched.current_index(), (frame % 3) as usize);
        sched.begin_frame(&mut rm).unwrap();
        assert_eq!(sched.current_slot().state(), SlotState::Recording);
        sched.submit_and_advance(None).unwrap();
    }
    assert_eq!(sched.frame_count(), 10);
    // Frames 0..=6 retired: slots 0, 1, 2 then 0, 1, 2, 0.
    assert_eq!(sched.retire_count(0), 3);
    assert_eq!(sched.retire_count(1), 2);
    assert_eq!(sched.retire_count(2), 2);
}

#[test]
fn wait_semaphore_and_signal_reach_the_queue() {
    let (device, mut rm, mut sched) = scheduler(2);
    sched.begin_frame(&mut rm).unwrap();
    let image_ready = sched.current_slot().image_ready();
    let finished = sched.submit_and_advance(Some(image_ready)).unwrap();

    let record = &device.submissions()[0];
    assert_eq!(record.wait_semaphores, vec![image_ready]);
    assert_eq!(record.signal_semaphores, vec![finished]);
    assert_eq!(
        sched.slot(0).unwrap().in_flight().unwrap().wait_semaphore(),
        Some(image_ready)
    );
}

// ============================================================================
// Retirement
// ============================================================================

#[test]
fn resource_used_in_flight_outlives_mark_delete() {
    let (device, mut rm, mut sched) = scheduler(2);
    let h = rm
        .create_device_buffer(128, wgpu::BufferUsages::UNIFORM)
        .unwrap();
    let buffer = rm.buffer(h).unwrap();

    sched.begin_frame(&mut rm).unwrap();
    assert!(sched.recording_buffer().use_resource(&mut rm, h));
    sched.submit_and_advance(None).unwrap();
    rm.mark_delete(h);

    // Slot 1 does not touch slot 0's references.
    run_frame(&mut sched, &mut rm);
    assert!(device.is_buffer_alive(buffer));
    assert_eq!(rm.ref_count(h), 1);

    // Reusing slot 0 retires frame 0.
    sched.begin_frame(&mut rm).unwrap();
    assert!(!device.is_buffer_alive(buffer));
    assert!(!rm.contains(h));
}

#[test]
fn retirement_resets_the_slot_binding_pool() {
    let (device, mut rm, mut sched) = scheduler(1);
    let layout = sortie::render::binding::DescriptorSetLayout::new(
        device.clone(),
        &[sortie::core::device::LayoutBinding::new(
            0,
            sortie::core::device::DescriptorKind::UniformBuffer,
            wgpu::ShaderStages::FRAGMENT,
        )],
    )
    .unwrap();

    sched.begin_frame(&mut rm).unwrap();
    for _ in 0..4 {
        sched
            .binding_allocator()
            .allocate_descriptor_set(&layout, None)
            .unwrap();
    }
    sched.submit_and_advance(None).unwrap();
    assert_eq!(device.live().descriptor_sets, 4);

    sched.begin_frame(&mut rm).unwrap();
    let stats = sched.current_slot().bindings().pool_statistics();
    assert_eq!(stats.pool_resets, 1);
    assert_eq!(stats.epoch_allocations, 0);
    assert_eq!(device.live().descriptor_sets, 0);
}

// ============================================================================
// Secondary command buffers
// ============================================================================

#[test]
fn secondaries_execute_inside_the_primary() {
    let (device, mut rm, mut sched) = scheduler(2);
    sched.begin_frame(&mut rm).unwrap();
    let a = sched.record_secondary(&mut rm, |rec, _| {
        rec.draw(3, 1);
        rec.handle()
    });
    let b = sched.record_secondary(&mut rm, |rec, _| {
        rec.draw(6, 2);
        rec.handle()
    });
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(sched.current_slot().pending_secondary_count(), 2);
    sched.submit_and_advance(None).unwrap();

    let primary = device.submissions()[0].command_buffers[0];
    let commands = device.commands(primary);
    assert!(matches!(
        commands.last(),
        Some(Command::ExecuteSecondary(list)) if list.as_slice() == [a, b]
    ));
    assert_eq!(sched.slot(0).unwrap().in_flight().unwrap().secondaries().len(), 2);
}

#[test]
fn retired_secondaries_are_recycled() {
    let (device, mut rm, mut sched) = scheduler(1);
    sched.begin_frame(&mut rm).unwrap();
    let first = sched.record_secondary(&mut rm, |rec, _| rec.handle()).unwrap();
    sched.submit_and_advance(None).unwrap();
    let created = device.live().command_buffers;

    sched.begin_frame(&mut rm).unwrap();
    let second = sched.record_secondary(&mut rm, |rec, _| rec.handle()).unwrap();
    assert_eq!(first, second);
    assert_eq!(device.live().command_buffers, created);
}

#[test]
fn secondary_references_are_released_on_retire() {
    let (_device, mut rm, mut sched) = scheduler(1);
    let h = rm
        .create_device_buffer(64, wgpu::BufferUsages::VERTEX)
        .unwrap();

    sched.begin_frame(&mut rm).unwrap();
    sched
        .record_secondary(&mut rm, |rec, rm| assert!(rec.use_resource(rm, h)))
        .unwrap();
    sched.submit_and_advance(None).unwrap();
    assert_eq!(rm.ref_count(h), 1);

    sched.begin_frame(&mut rm).unwrap();
    assert_eq!(rm.ref_count(h), 0);
}

#[test]
fn secondary_outside_recording_is_rejected() {
    let (_device, mut rm, mut sched) = scheduler(2);
    let err = sched.record_secondary(&mut rm, |_, _| ()).unwrap_err();
    assert!(matches!(err, SortieError::SlotState { slot: 0, .. }));
    assert!(!err.is_fatal());
}

// ============================================================================
// Fatal errors
// ============================================================================

#[test]
fn failed_fence_wait_keeps_frame_in_flight() {
    let (device, mut rm, mut sched) = scheduler(1);
    let h = rm
        .create_device_buffer(64, wgpu::BufferUsages::UNIFORM)
        .unwrap();

    sched.begin_frame(&mut rm).unwrap();
    sched.recording_buffer().use_resource(&mut rm, h);
    sched.submit_and_advance(None).unwrap();

    device.fail_next_fence_wait();
    let err = sched.begin_frame(&mut rm).unwrap_err();
    assert!(matches!(err, SortieError::FenceWait { slot: 0, .. }));
    assert!(err.is_fatal());

    let slot = sched.slot(0).unwrap();
    assert!(slot.is_in_flight());
    assert_eq!(slot.state(), SlotState::Submitted);
    assert_eq!(rm.ref_count(h), 1);
    assert!(device.fence_wait_log().is_empty());

    // Nothing was torn down, so a later wait can still retire the frame.
    sched.begin_frame(&mut rm).unwrap();
    assert_eq!(rm.ref_count(h), 0);
}

#[test]
fn lost_device_fails_submission() {
    let (device, mut rm, mut sched) = scheduler(2);
    sched.begin_frame(&mut rm).unwrap();
    device.set_device_lost(true);

    let err = sched.submit_and_advance(None).unwrap_err();
    assert!(matches!(err, SortieError::Submit(_)));
    assert!(err.is_fatal());
    assert_eq!(sched.frame_count(), 0);
    assert_eq!(sched.current_slot().state(), SlotState::Recording);
}

#[test]
fn failed_end_returns_sync_objects_and_secondaries() {
    let (device, mut rm, mut sched) = scheduler(2);
    sched.begin_frame(&mut rm).unwrap();
    sched.record_secondary(&mut rm, |rec, _| rec.draw(3, 1)).unwrap();

    device.fail_next_command_buffer_end();
    let err = sched.submit_and_advance(None).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(sched.frame_count(), 0);
    assert_eq!(device.stats().submits, 0);

    let slot = sched.current_slot();
    assert_eq!(slot.state(), SlotState::Recording);
    assert_eq!(slot.pending_secondary_count(), 1);
    assert_eq!(sched.sync_pool().available_fences(), 1);
    assert_eq!(sched.sync_pool().available_semaphores(), 1);

    // The returned pair is reused by the next attempt.
    sched.submit_and_advance(None).unwrap();
    assert_eq!(sched.sync_pool().created_fences(), 1);
    assert_eq!(sched.sync_pool().created_semaphores(), 1);
}

#[test]
fn failed_reset_still_retires_the_slot() {
    let (device, mut rm, mut sched) = scheduler(1);
    let h = rm
        .create_device_buffer(64, wgpu::BufferUsages::UNIFORM)
        .unwrap();
    let buffer = rm.buffer(h).unwrap();

    sched.begin_frame(&mut rm).unwrap();
    sched.recording_buffer().use_resource(&mut rm, h);
    sched.submit_and_advance(None).unwrap();
    rm.mark_delete(h);

    device.fail_next_command_buffer_reset();
    assert!(sched.begin_frame(&mut rm).is_err());

    let slot = sched.slot(0).unwrap();
    assert_eq!(slot.state(), SlotState::Idle);
    assert!(!slot.is_in_flight());
    assert_eq!(slot.retire_count(), 1);
    assert_eq!(slot.bindings().pool_statistics().pool_resets, 1);
    assert!(!rm.contains(h));
    assert!(!device.is_buffer_alive(buffer));
    assert_eq!(sched.sync_pool().available_fences(), 1);

    // The slot is usable again.
    run_frame(&mut sched, &mut rm);
    assert_eq!(sched.frame_count(), 2);
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn shutdown_collects_pending_deletes() {
    let (device, mut rm, mut sched) = scheduler(3);
    let h = rm
        .create_device_buffer(64, wgpu::BufferUsages::UNIFORM)
        .unwrap();

    sched.begin_frame(&mut rm).unwrap();
    sched.recording_buffer().use_resource(&mut rm, h);
    sched.submit_and_advance(None).unwrap();
    rm.mark_delete(h);

    sched.shutdown(&mut rm).unwrap();
    assert!(sched.is_shut_down());
    assert!(!rm.contains(h));
    assert_eq!(device.live().buffers, 0);

    // Second shutdown is a no-op.
    sched.shutdown(&mut rm).unwrap();
}

#[test]
fn frame_calls_after_shutdown_are_rejected() {
    let (_device, mut rm, mut sched) = scheduler(2);
    run_frame(&mut sched, &mut rm);
    sched.shutdown(&mut rm).unwrap();

    assert!(matches!(sched.begin_frame(&mut rm), Err(SortieError::ShutDown)));
    assert!(matches!(sched.submit_and_advance(None), Err(SortieError::ShutDown)));
    let err = sched.record_secondary(&mut rm, |_, _| ()).unwrap_err();
    assert!(matches!(err, SortieError::ShutDown));
    assert!(!err.is_fatal());
    sched.wait_device_idle(&mut rm).unwrap();
}
