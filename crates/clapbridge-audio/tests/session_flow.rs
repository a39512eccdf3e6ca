//! End-to-end pump behavior against the simulated device backend.

use clapbridge_audio::{ProduceStatus, PumpMode, PumpTuning, SessionState, StreamSession};
use clapbridge_core::{Frame, Frames, HostBlockConfig};
use clapbridge_device::sim::{SimBackend, SimDevice, SimDeviceConfig};
use clapbridge_device::{Endpoint, LoopbackTarget};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn host(max_block: Frames) -> HostBlockConfig {
    HostBlockConfig::new(48000, 1, max_block)
}

/// Frames with a running index in the left channel
fn ramp(start: usize, count: usize) -> Vec<Frame> {
    (start..start + count)
        .map(|i| Frame::new(i as f32, -(i as f32)))
        .collect()
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn capture_session(device: &SimDevice, max_block: Frames) -> StreamSession {
    let backend = SimBackend::new().with_device("mic", device.clone());
    let mut session = StreamSession::new(Arc::new(backend));
    session
        .activate(
            &Endpoint::Input("mic".into()),
            host(max_block),
            &PumpTuning::default(),
        )
        .unwrap();
    session
}

fn render_session(device: &SimDevice, max_block: Frames) -> StreamSession {
    let backend = SimBackend::new().with_device("spk", device.clone());
    let mut session = StreamSession::new(Arc::new(backend));
    session
        .activate(
            &Endpoint::Output("spk".into()),
            host(max_block),
            &PumpTuning::default(),
        )
        .unwrap();
    session
}

/// Pull one block, returning the frames if it was delivered
fn pull(session: &mut StreamSession, frames: Frames) -> Option<Vec<Frame>> {
    let mut left = vec![0.0; frames];
    let mut right = vec![0.0; frames];
    match session.produce(&mut left, &mut right) {
        ProduceStatus::Delivered => Some(
            left.into_iter()
                .zip(right)
                .map(|(l, r)| Frame::new(l, r))
                .collect(),
        ),
        ProduceStatus::Pending | ProduceStatus::Inactive => None,
    }
}

#[test]
fn test_inline_poll_loses_nothing() {
    let mic = SimDevice::capture(SimDeviceConfig::capture(1024));
    let mut session = capture_session(&mic, 256);
    assert_eq!(session.pump_mode(), Some(PumpMode::InlinePoll));

    let packet_sizes = [100, 300, 37, 475, 512, 88, 24];
    let total: usize = packet_sizes.iter().sum();
    assert_eq!(total % 256, 0);

    let mut sent = 0;
    let mut received = Vec::new();
    for size in packet_sizes {
        assert!(mic.deliver(&ramp(sent, size)));
        sent += size;
        while let Some(block) = pull(&mut session, 256) {
            received.extend(block);
        }
    }

    assert_eq!(received, ramp(0, total));
    let stats = session.stats();
    assert_eq!(stats.frames_captured, total as u64);
    assert_eq!(stats.frames_dropped, 0);
}

#[test]
fn test_pending_leaves_block_untouched() {
    let mic = SimDevice::capture(SimDeviceConfig::capture(1024));
    let mut session = capture_session(&mic, 256);

    mic.deliver(&ramp(0, 100));
    let mut left = [9.0; 256];
    let mut right = [9.0; 256];
    assert_eq!(
        session.produce(&mut left, &mut right),
        ProduceStatus::Pending
    );
    assert!(left.iter().chain(right.iter()).all(|&s| s == 9.0));
    assert_eq!(session.buffered_frames(), 100);

    mic.deliver(&ramp(100, 156));
    assert_eq!(pull(&mut session, 256), Some(ramp(0, 256)));
    assert_eq!(session.stats().blocks_pending, 1);
    assert_eq!(session.stats().blocks_delivered, 1);
}

#[test]
fn test_overflow_is_dropped_and_counted() {
    let mic = SimDevice::capture(SimDeviceConfig::capture(1024));
    let mut session = capture_session(&mic, 256);

    // Ring holds 2048 frames
    mic.deliver(&ramp(0, 3000));
    assert_eq!(pull(&mut session, 256), Some(ramp(0, 256)));

    let stats = session.stats();
    assert_eq!(stats.frames_captured, 2048);
    assert_eq!(stats.frames_dropped, 952);
    assert!(stats.peak_buffered <= 2048);
    assert_eq!(session.buffered_frames(), 2048 - 256);
}

#[test]
fn test_device_failure_is_no_data() {
    let mic = SimDevice::capture(SimDeviceConfig::capture(1024));
    let mut session = capture_session(&mic, 256);

    mic.deliver(&ramp(0, 256));
    mic.fail_packets(true);
    assert_eq!(pull(&mut session, 256), None);
    assert!(session.stats().device_errors >= 1);

    mic.fail_packets(false);
    assert_eq!(pull(&mut session, 256), Some(ramp(0, 256)));
}

#[test]
fn test_threaded_matches_inline() {
    let packet = 128;
    let block = 256;
    let packets = 16;

    // Input device whose buffer is shorter than a host block
    let threaded_mic = SimDevice::capture(SimDeviceConfig::capture(packet));
    let mut threaded = capture_session(&threaded_mic, block);
    assert_eq!(threaded.pump_mode(), Some(PumpMode::Threaded));

    let inline_mic = SimDevice::capture(SimDeviceConfig::capture(1024));
    let mut inline = capture_session(&inline_mic, block);
    assert_eq!(inline.pump_mode(), Some(PumpMode::InlinePoll));

    let mut from_threaded = Vec::new();
    let mut from_inline = Vec::new();
    for i in 0..packets {
        let frames = ramp(i * packet, packet);

        assert!(threaded_mic.deliver(&frames));
        assert!(wait_until(|| threaded_mic.pending_packets() == 0));
        assert!(inline_mic.deliver(&frames));

        if i % 2 == 1 {
            from_threaded.extend(pull(&mut threaded, block).unwrap());
            from_inline.extend(pull(&mut inline, block).unwrap());
        }
    }

    assert_eq!(from_threaded, ramp(0, packet * packets));
    assert_eq!(from_threaded, from_inline);
    assert_eq!(threaded.stats().frames_dropped, 0);
}

#[test]
fn test_loopback_uses_packet_multiple() {
    let small = SimDevice::capture(SimDeviceConfig::capture(100));
    let backend = SimBackend::new().with_loopback(small);
    let mut session = StreamSession::new(Arc::new(backend));
    session
        .activate(
            &Endpoint::Loopback(LoopbackTarget::System),
            host(512),
            &PumpTuning::default(),
        )
        .unwrap();
    assert_eq!(session.pump_mode(), Some(PumpMode::Threaded));

    let large = SimDevice::capture(SimDeviceConfig::capture(200));
    let backend = SimBackend::new().with_loopback(large);
    let mut session = StreamSession::new(Arc::new(backend));
    session
        .activate(
            &Endpoint::Loopback(LoopbackTarget::System),
            host(512),
            &PumpTuning::default(),
        )
        .unwrap();
    assert_eq!(session.pump_mode(), Some(PumpMode::InlinePoll));
}

#[test]
fn test_shutdown_stops_device_calls() {
    let mic = SimDevice::capture(SimDeviceConfig::capture(128));
    let mut session = capture_session(&mic, 512);
    assert_eq!(session.pump_mode(), Some(PumpMode::Threaded));

    mic.deliver(&ramp(0, 128));
    assert!(wait_until(|| mic.pending_packets() == 0));

    session.deactivate();
    assert_eq!(session.state(), SessionState::Idle);
    assert!(!mic.is_running());

    let calls = mic.service_calls();
    assert!(mic.signal_event());
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(mic.service_calls(), calls);

    // Deactivating twice is harmless
    session.deactivate();
}

#[test]
fn test_render_start_latch() {
    let speaker = SimDevice::render(SimDeviceConfig::render(480, 4800));
    let mut session = render_session(&speaker, 128);
    assert_eq!(session.device_buffer_frames(), Some(4800));

    let block = [0.25; 128];
    let mut starts = Vec::new();
    for _ in 0..4 {
        let report = session.consume(&block, &block).unwrap();
        assert_eq!(report.sent, 128);
        starts.push(report.started_playback);
    }
    assert_eq!(starts, [false, false, false, true]);
    assert!(speaker.is_running());
    assert_eq!(speaker.start_count(), 1);

    for _ in 0..4 {
        assert!(!session.consume(&block, &block).unwrap().started_playback);
    }
    assert_eq!(speaker.start_count(), 1);
    assert!(session.render_flow().unwrap().started);
}

#[test]
fn test_render_partial_drop() {
    let speaker = SimDevice::render(SimDeviceConfig::render(100, 1000));
    let mut session = render_session(&speaker, 300);

    let block = [0.5; 300];
    for _ in 0..3 {
        session.consume(&block, &block).unwrap();
    }
    assert_eq!(speaker.queued_frames(), 900);

    let left: Vec<f32> = (0..256).map(|i| i as f32).collect();
    let report = session.consume(&left, &left).unwrap();
    assert_eq!(report.sent, 100);
    assert_eq!(report.dropped, 156);
    assert_eq!(session.render_flow().unwrap().padding, 900);

    let played = speaker.play(1000);
    assert_eq!(played.len(), 1000);
    let expected: Vec<Frame> = (0..100).map(|i| Frame::new(i as f32, i as f32)).collect();
    assert_eq!(played[900..], expected[..]);
    assert_eq!(session.stats().frames_render_dropped, 156);
}

#[test]
fn test_render_reset_rearms_latch() {
    let speaker = SimDevice::render(SimDeviceConfig::render(480, 4800));
    let mut session = render_session(&speaker, 512);

    let block = [0.1; 512];
    assert!(session.consume(&block, &block).unwrap().started_playback);
    assert_eq!(speaker.start_count(), 1);

    session.reset().unwrap();
    assert!(!speaker.is_running());
    assert_eq!(speaker.queued_frames(), 0);
    assert!(!session.render_flow().unwrap().started);

    assert!(session.consume(&block, &block).unwrap().started_playback);
    assert_eq!(speaker.start_count(), 2);
}

#[test]
fn test_failed_render_reset_still_rearms_latch() {
    let speaker = SimDevice::render(SimDeviceConfig::render(480, 4800));
    let mut session = render_session(&speaker, 512);

    let block = [0.1; 512];
    assert!(session.consume(&block, &block).unwrap().started_playback);

    speaker.fail_reset(true);
    assert!(session.reset().is_err());
    assert!(!speaker.is_running());
    assert!(!session.render_flow().unwrap().started);

    speaker.fail_reset(false);
    assert!(session.consume(&block, &block).unwrap().started_playback);
    assert!(speaker.is_running());
    assert_eq!(speaker.start_count(), 2);
}
