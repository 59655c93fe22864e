//! End-to-end stream scenarios on the simulated device.
//!
//! Run with:
//! ```bash
//! cargo test -p duplex --test stream_tests
//! ```

mod helpers;

use approx::assert_relative_eq;
use duplex::prelude::*;
use duplex::{DropoutKinds, InputSignal, LatencyCorrection};
use helpers::*;
use std::sync::atomic::Ordering;

// =============================================================================
// Duplex Scenarios
// =============================================================================

/// 2 s buffers at 44.1 kHz, one playback and one capture track, five seconds.
#[test]
fn test_five_second_duplex_take() {
    let (mut controller, device) = test_controller(device_config(BLOCK, 0.01), buffers(2.0));
    let backing = constant_track(TEST_RATE, 5.0, 0.25);
    let take = share(MemoryTrack::new(TEST_RATE, 1));
    device.set_input(InputSignal::Constant(0.5));

    let token = controller
        .start_stream(
            vec![PlaybackTrack::new(backing.clone())],
            vec![CaptureTrack::new(take.clone())],
            0.0,
            5.0,
            StreamOptions::default(),
        )
        .unwrap();
    assert!(controller.is_stream_active(Some(token)));
    assert_eq!(controller.device_info().unwrap().sample_rate, TEST_RATE);

    pump(&controller, &device, 500);
    controller.stop_stream().unwrap();

    assert!(controller.lost_capture_intervals().is_empty());
    // five seconds minus the 10 ms input latency trimmed from the start
    let take = take.lock();
    assert_eq!(take.len_frames(), 5 * 44100 - 441);
    assert!(take.is_finished());
    assert!(take.samples().iter().all(|&s| s == 0.5));

    let output = device.recorded_output();
    assert_eq!(output.len(), 500 * BLOCK * 2);
    assert_eq!(longest_silence(&output, 2), 0);
    assert_relative_eq!(peak(&output), 0.25, epsilon = FLOAT_EPSILON);
}

/// A storage stall longer than the playback buffer is heard as silence and
/// recorded as exactly one lost interval.
#[test]
fn test_stalled_worker_gives_one_dropout() {
    let (mut controller, device) = test_controller(device_config(BLOCK, 0.0), buffers(0.25));
    let (gated, stalled) = GatedTrack::new(MemoryTrack::from_samples(
        TEST_RATE,
        1,
        vec![0.25; 44100 * 4],
    ));

    controller
        .start_stream(
            vec![PlaybackTrack::new(share(gated))],
            Vec::new(),
            0.0,
            4.0,
            StreamOptions::default(),
        )
        .unwrap();
    pump(&controller, &device, 20);

    stalled.store(true, Ordering::Release);
    assert_eq!(device.run_cycles(60), 60);
    stalled.store(false, Ordering::Release);

    pump(&controller, &device, 20);
    controller.stop_stream().unwrap();

    let lost = controller.lost_capture_intervals();
    assert_eq!(lost.len(), 1, "expected one dropout, got {:?}", lost);
    let stall = lost[0];
    assert!(stall.kinds.contains(DropoutKinds::PLAYBACK));
    assert!(stall.start >= 0.2 && stall.start < 0.8, "start {}", stall.start);
    // 0.6 s stalled minus whatever the 0.25 s ring still held
    assert!(
        stall.duration > 0.3 && stall.duration <= 0.6 + 1e-9,
        "duration {}",
        stall.duration
    );

    let silent = longest_silence(&device.recorded_output(), 2);
    assert_eq!(silent, (stall.duration * TEST_RATE).round() as usize);
}

/// Capture without resampling stores exactly what the device delivered.
#[test]
fn test_capture_is_bit_identical() {
    let (mut controller, device) = test_controller(device_config(BLOCK, 0.0), buffers(0.5));
    let take = share(MemoryTrack::new(TEST_RATE, 1));
    device.set_input(InputSignal::Ramp(0.001));

    controller
        .start_stream(
            Vec::new(),
            vec![CaptureTrack::new(take.clone())],
            0.0,
            10.0,
            StreamOptions::default().latency_correction(LatencyCorrection::None),
        )
        .unwrap();
    pump(&controller, &device, 100);
    controller.stop_stream().unwrap();

    let expected: Vec<f32> = (0..100 * BLOCK)
        .map(|n| (n as f32 * 0.001).fract())
        .collect();
    let take = take.lock();
    assert_eq!(take.samples(), expected.as_slice());
    assert_eq!(take.capture_times()[0], 0.0);
    assert!(take.capture_times().windows(2).all(|w| w[0] <= w[1]));
}

/// Straight capture stops at the end bound even while the device keeps
/// running, and the reported position never passes it.
#[test]
fn test_capture_stops_at_end_bound() {
    let (mut controller, device) = test_controller(device_config(BLOCK, 0.0), buffers(0.5));
    let take = share(MemoryTrack::new(TEST_RATE, 1));
    device.set_input(InputSignal::Constant(0.5));

    controller
        .start_stream(
            Vec::new(),
            vec![CaptureTrack::new(take.clone())],
            1.0,
            1.5,
            StreamOptions::default().latency_correction(LatencyCorrection::None),
        )
        .unwrap();
    pump(&controller, &device, 40);
    assert!(!controller.is_playback_complete());
    let midway = controller.current_stream_time().unwrap();
    assert_relative_eq!(midway, 1.0 + 40.0 * BLOCK as f64 / TEST_RATE, epsilon = 1e-9);

    pump(&controller, &device, 40);
    assert!(controller.is_playback_complete());
    assert_relative_eq!(controller.current_stream_time().unwrap(), 1.5, epsilon = 1e-9);
    controller.stop_stream().unwrap();

    assert!(controller.lost_capture_intervals().is_empty());
    let take = take.lock();
    assert_eq!(take.len_frames(), 22050);
    assert!(take.samples().iter().all(|&s| s == 0.5));
}

/// Capture into a track at another rate goes through the converter.
#[test]
fn test_capture_resamples_to_track_rate() {
    let (mut controller, device) = test_controller(device_config(BLOCK, 0.0), buffers(0.5));
    let take = share(MemoryTrack::new(48000.0, 1));
    device.set_input(InputSignal::Constant(0.5));

    controller
        .start_stream(
            Vec::new(),
            vec![CaptureTrack::new(take.clone())],
            0.0,
            10.0,
            StreamOptions::default().latency_correction(LatencyCorrection::None),
        )
        .unwrap();
    assert_eq!(controller.device_info().unwrap().sample_rate, TEST_RATE);
    pump(&controller, &device, 100);
    controller.stop_stream().unwrap();

    let take = take.lock();
    let frames = take.len_frames() as f64;
    assert!((frames - 48000.0).abs() < 480.0, "captured {} frames", frames);
    let middle = &take.samples()[20000..28000];
    assert!(middle.iter().all(|s| (s - 0.5).abs() < 0.02));
}

/// Two input channels into a stereo track starting at device channel 0, and
/// a mono track bound to device channel 1.
#[test]
fn test_capture_channel_binding() {
    let (mut controller, device) = test_controller(device_config(BLOCK, 0.0), buffers(0.5));
    let stereo = share(MemoryTrack::new(TEST_RATE, 2));
    let right = share(MemoryTrack::new(TEST_RATE, 1));
    device.set_input(InputSignal::Ramp(0.001));

    controller
        .start_stream(
            Vec::new(),
            vec![
                CaptureTrack::new(stereo.clone()),
                CaptureTrack::new(right.clone()).from_channel(1),
            ],
            0.0,
            10.0,
            StreamOptions::default().latency_correction(LatencyCorrection::None),
        )
        .unwrap();
    pump(&controller, &device, 10);
    controller.stop_stream().unwrap();

    let stereo = stereo.lock();
    let right = right.lock();
    assert_eq!(stereo.len_frames(), 10 * BLOCK as u64);
    assert_eq!(right.len_frames(), 10 * BLOCK as u64);
    for (frame, &r) in stereo.samples().chunks_exact(2).zip(right.samples()) {
        assert_eq!(frame[1], r);
    }
}

// =============================================================================
// Transport
// =============================================================================

#[test]
fn test_pause_outputs_silence_and_holds_time() {
    let (mut controller, device) = test_controller(device_config(BLOCK, 0.0), buffers(0.5));
    let backing = constant_track(TEST_RATE, 5.0, 0.25);
    controller
        .start_stream(
            vec![PlaybackTrack::new(backing)],
            Vec::new(),
            0.0,
            5.0,
            StreamOptions::default(),
        )
        .unwrap();

    pump(&controller, &device, 10);
    let before = controller.current_stream_time().unwrap();
    assert_relative_eq!(before, 0.1, epsilon = 1e-9);

    controller.set_paused(true);
    assert!(controller.is_paused());
    device.clear_recorded();
    device.run_cycles(10);
    assert!(peak(&device.recorded_output()) <= SILENCE_THRESHOLD);
    assert_eq!(controller.current_stream_time(), Some(before));

    controller.set_paused(false);
    device.clear_recorded();
    pump(&controller, &device, 10);
    assert_relative_eq!(peak(&device.recorded_output()), 0.25, epsilon = FLOAT_EPSILON);
    assert_relative_eq!(controller.current_stream_time().unwrap(), 0.2, epsilon = 1e-9);

    controller.stop_stream().unwrap();
    assert!(controller.lost_capture_intervals().is_empty());
}

#[test]
fn test_seek_moves_audible_position() {
    let (mut controller, device) = test_controller(device_config(BLOCK, 0.0), buffers(0.2));
    let backing = staircase_track(TEST_RATE, 10.0, 1.0 / 441000.0);
    controller
        .start_stream(
            vec![PlaybackTrack::new(backing)],
            Vec::new(),
            0.0,
            10.0,
            StreamOptions::default(),
        )
        .unwrap();
    pump(&controller, &device, 20);

    controller.seek_stream(5.0).unwrap();
    assert!(wait_until(|| {
        device.run_cycle();
        controller.current_stream_time().is_some_and(|t| t >= 5.0)
    }));
    pump(&controller, &device, 10);

    let now = controller.current_stream_time().unwrap();
    assert!((5.0..6.0).contains(&now), "now {}", now);
    controller.stop_stream().unwrap();
    assert!(matches!(
        controller.seek_stream(1.0),
        Err(duplex::stream::Error::NotActive)
    ));
}

#[test]
fn test_looped_pass_returns_to_start() {
    let (mut controller, device) = test_controller(device_config(BLOCK, 0.0), buffers(0.2));
    let backing = constant_track(TEST_RATE, 1.0, 0.25);
    controller
        .start_stream(
            vec![PlaybackTrack::new(backing)],
            Vec::new(),
            0.0,
            0.5,
            StreamOptions::looped(),
        )
        .unwrap();

    // one pass of real time
    pump(&controller, &device, 50);
    assert_eq!(controller.current_pass(), Some(1));
    assert_relative_eq!(controller.current_stream_time().unwrap(), 0.0, epsilon = 1e-9);

    pump(&controller, &device, 25);
    assert_eq!(controller.current_pass(), Some(1));
    assert_relative_eq!(controller.current_stream_time().unwrap(), 0.25, epsilon = 1e-9);

    assert!(!controller.is_playback_complete());
    controller.stop_stream().unwrap();
    assert!(controller.lost_capture_intervals().is_empty());
}

#[test]
fn test_straight_playback_completes_without_dropout() {
    let (mut controller, device) = test_controller(device_config(BLOCK, 0.0), buffers(0.2));
    let backing = constant_track(TEST_RATE, 1.0, 0.25);
    controller
        .start_stream(
            vec![PlaybackTrack::new(backing)],
            Vec::new(),
            0.0,
            0.5,
            StreamOptions::default(),
        )
        .unwrap();

    pump(&controller, &device, 50);
    device.run_cycles(5);
    assert!(controller.is_playback_complete());
    assert_relative_eq!(controller.current_stream_time().unwrap(), 0.5, epsilon = 1e-9);

    controller.stop_stream().unwrap();
    assert!(controller.lost_capture_intervals().is_empty());
}

// =============================================================================
// Scrubbing
// =============================================================================

#[test]
fn test_scrub_below_min_stutter_enqueues_nothing() {
    let (mut controller, device) = test_controller(device_config(BLOCK, 0.0), buffers(0.5));
    let backing = constant_track(TEST_RATE, 10.0, 0.25);
    let options = ScrubOptions::default();
    let min_stutter = options.min_stutter;
    controller
        .start_stream(
            vec![PlaybackTrack::new(backing)],
            Vec::new(),
            2.0,
            10.0,
            StreamOptions::scrub(options),
        )
        .unwrap();

    assert_eq!(controller.last_time_in_scrub_queue(), Some(2.0));
    assert!(!controller.enqueue_scrub(ScrubTarget::Position(4.0), min_stutter / 2.0));
    assert_eq!(controller.last_time_in_scrub_queue(), Some(2.0));
    assert_eq!(controller.current_stream_time(), Some(2.0));

    assert!(controller.enqueue_scrub(ScrubTarget::Position(3.0), min_stutter * 2.0));
    assert_eq!(controller.last_time_in_scrub_queue(), Some(3.0));

    device.run_cycles(5);
    controller.stop_stream().unwrap();
}

#[test]
fn test_scrub_is_playback_only() {
    let (mut controller, _device) = test_controller(device_config(BLOCK, 0.0), buffers(0.5));
    let result = controller.start_stream(
        vec![PlaybackTrack::new(constant_track(TEST_RATE, 1.0, 0.25))],
        vec![CaptureTrack::new(share(MemoryTrack::new(TEST_RATE, 1)))],
        0.0,
        1.0,
        StreamOptions::scrub(ScrubOptions::default()),
    );
    assert!(result.is_err());
    assert!(!controller.is_busy());
}
