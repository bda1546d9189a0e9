//! Integration tests for the sound dose tracker
//!
//! These tests drive the coordinator end to end, the way an audio pipeline
//! and a listener would:
//! - PCM through per-stream processors into the rolling CSD
//! - Momentary exposure warnings against the RS2 threshold
//! - Listener registration, replacement and death
//! - Dose accounting across devices and the rolling window

use std::sync::{Arc, Barrier};
use std::thread;

use sound_dose::clock::ManualClock;
use sound_dose::mel::CSD_WINDOW_SECONDS;
use sound_dose::{
    AudioFormat, ChannelListener, DeviceId, DoseConfig, DoseError, DoseEvent, MelCallback,
    MelProcessor, SoundDoseManager, SoundDoseRecord, StreamHandle,
};
use tokio::sync::mpsc::Receiver;

const START: i64 = 1_700_000_000;
const SAMPLE_RATE: u32 = 48_000;
const CHANNELS: usize = 2;
const OFFSET_DBA: f32 = 110.0;

fn setup() -> (Arc<SoundDoseManager>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(START));
    let manager = SoundDoseManager::with_clock(&DoseConfig::default(), clock.clone());
    (manager, clock)
}

fn open_stream(manager: &SoundDoseManager, stream: i32, device: i32) -> Arc<MelProcessor> {
    manager
        .get_or_create_processor_for_device(
            DeviceId(device),
            StreamHandle(stream),
            SAMPLE_RATE,
            CHANNELS,
            AudioFormat::PcmFloat,
        )
        .expect("processor creation")
        .expect("framework MEL enabled")
}

/// One second of constant stereo float PCM measuring `mel` dBA.
fn second_at(mel: f32) -> Vec<u8> {
    let frame_energy = 10f64.powf((mel - OFFSET_DBA) as f64 / 10.0);
    let amplitude = (frame_energy / CHANNELS as f64).sqrt() as f32;
    (0..SAMPLE_RATE as usize * CHANNELS)
        .flat_map(|_| amplitude.to_le_bytes())
        .collect()
}

fn drain(rx: &mut Receiver<DoseEvent>) -> Vec<DoseEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn momentary(events: &[DoseEvent]) -> Vec<(f32, DeviceId)> {
    events
        .iter()
        .filter_map(|event| match event {
            DoseEvent::MomentaryExposure {
                current_mel,
                device_id,
            } => Some((*current_mel, *device_id)),
            DoseEvent::NewCsdValue { .. } => None,
        })
        .collect()
}

/// Stream 42 plays 70, 95 then 101 dBA with RS2 at 100 dBA
#[test]
fn test_stream_lifecycle_with_momentary_warning() {
    let (manager, clock) = setup();
    let (listener, mut rx) = ChannelListener::new();
    let surface = manager.get_sound_dose_interface(Arc::new(listener)).unwrap();
    surface.set_output_rs2(100.0).unwrap();

    let processor = open_stream(&manager, 42, 3);
    let first_instance = processor.instance_id();

    let mut previous_csd = surface.get_csd().unwrap();
    for mel in [70.0, 95.0, 101.0] {
        assert_eq!(processor.process(&second_at(mel)), 1);
        clock.advance(1);

        let csd = surface.get_csd().unwrap();
        assert!(csd > previous_csd, "dose must grow: {csd} <= {previous_csd}");
        previous_csd = csd;
    }

    let events = drain(&mut rx);
    let warnings = momentary(&events);
    assert_eq!(warnings.len(), 1, "only 101 dBA exceeds RS2: {warnings:?}");
    assert!((warnings[0].0 - 101.0).abs() < 0.01);
    assert_eq!(warnings[0].1, DeviceId(3));

    let records = surface.get_records().unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.windows(2).all(|pair| pair[0].timestamp < pair[1].timestamp));
    let last = records.last().unwrap();
    assert!((last.cumulative_dose - previous_csd).abs() < 1e-9);

    manager.remove_stream_processor(StreamHandle(42));
    let reopened = open_stream(&manager, 42, 3);
    assert_ne!(reopened.instance_id(), first_instance);
}

#[test]
fn test_unknown_stream_removal_is_noop() {
    let (manager, _clock) = setup();
    let _processor = open_stream(&manager, 1, 1);

    manager.remove_stream_processor(StreamHandle(999));
    assert_eq!(manager.active_processor_count(), 1);
}

#[test]
fn test_rs2_bounds_via_surface() {
    let (manager, _clock) = setup();
    let (listener, _rx) = ChannelListener::new();
    let surface = manager.get_sound_dose_interface(Arc::new(listener)).unwrap();

    surface.set_output_rs2(95.0).unwrap();
    assert_eq!(
        surface.set_output_rs2(79.9),
        Err(DoseError::InvalidArgument { value: 79.9 })
    );
    assert_eq!(
        surface.set_output_rs2(100.1),
        Err(DoseError::InvalidArgument { value: 100.1 })
    );
    assert_eq!(surface.get_output_rs2().unwrap(), 95.0);

    surface.set_output_rs2(80.0).unwrap();
    assert_eq!(surface.get_output_rs2().unwrap(), 80.0);
    surface.set_output_rs2(100.0).unwrap();
    assert_eq!(surface.get_output_rs2().unwrap(), 100.0);
}

#[test]
fn test_reset_replaces_accumulated_dose() {
    let (manager, clock) = setup();
    let (listener, _rx) = ChannelListener::new();
    let surface = manager.get_sound_dose_interface(Arc::new(listener)).unwrap();
    let processor = open_stream(&manager, 5, 1);

    processor.process(&second_at(100.0));
    clock.advance(1);
    assert!(surface.get_csd().unwrap() > 0.0);

    let restored = vec![SoundDoseRecord {
        timestamp: START - 86_400,
        duration: 600,
        value: 0.2,
        average_mel: 96.0,
        cumulative_dose: 0.2,
    }];
    surface.reset_csd(0.2, &restored).unwrap();
    assert_eq!(surface.get_csd().unwrap(), 0.2);
    assert_eq!(surface.get_records().unwrap(), restored);

    surface.reset_csd(0.0, &[]).unwrap();
    assert_eq!(surface.get_csd().unwrap(), 0.0);
    assert!(surface.get_records().unwrap().is_empty());
}

#[test]
fn test_momentary_exposure_waits_for_listener() {
    let (manager, clock) = setup();
    let processor = open_stream(&manager, 8, 2);

    // Nobody listening: the warning is dropped, not queued
    processor.process(&second_at(102.0));
    clock.advance(1);

    let (listener, mut rx) = ChannelListener::new();
    let _surface = manager.get_sound_dose_interface(Arc::new(listener)).unwrap();
    assert!(drain(&mut rx).is_empty());

    processor.process(&second_at(102.0));
    let warnings = momentary(&drain(&mut rx));
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].1, DeviceId(2));
}

#[test]
fn test_replaced_listener_surface_is_revoked() {
    let (manager, _clock) = setup();
    let (first, mut first_rx) = ChannelListener::new();
    let old_surface = manager.get_sound_dose_interface(Arc::new(first)).unwrap();
    let (second, mut second_rx) = ChannelListener::new();
    let new_surface = manager.get_sound_dose_interface(Arc::new(second)).unwrap();

    assert_eq!(old_surface.get_csd(), Err(DoseError::InterfaceRevoked));
    assert_eq!(
        old_surface.reset_csd(0.0, &[]),
        Err(DoseError::InterfaceRevoked)
    );

    // Death of the replaced listener leaves the new one registered
    old_surface.on_disconnected();
    assert!(new_surface.is_active());

    manager.on_momentary_exposure(101.0, DeviceId(1));
    assert!(drain(&mut first_rx).is_empty());
    assert_eq!(momentary(&drain(&mut second_rx)).len(), 1);
}

#[test]
fn test_dropped_channel_counts_as_listener_death() {
    let (manager, _clock) = setup();
    let (listener, rx) = ChannelListener::new();
    let surface = manager.get_sound_dose_interface(Arc::new(listener)).unwrap();
    drop(rx);

    manager.on_momentary_exposure(101.0, DeviceId(1));
    assert!(!manager.has_listener());
    assert_eq!(surface.get_csd(), Err(DoseError::InterfaceRevoked));
}

#[test]
fn test_accounting_modes_across_devices() {
    let (manager, clock) = setup();
    let (listener, _rx) = ChannelListener::new();
    let surface = manager.get_sound_dose_interface(Arc::new(listener)).unwrap();
    let speaker = open_stream(&manager, 1, 1);
    let headset = open_stream(&manager, 2, 2);

    speaker.process(&second_at(90.0));
    headset.process(&second_at(90.0));
    clock.advance(1);
    let loudest_only = surface.get_csd().unwrap();

    surface.force_compute_csd_on_all_devices(true).unwrap();
    speaker.process(&second_at(90.0));
    headset.process(&second_at(90.0));
    clock.advance(1);
    let both = surface.get_csd().unwrap() - loudest_only;

    // Two equal sources double the energy and the dose
    assert!((both / loudest_only - 2.0).abs() < 1e-2);
}

#[test]
fn test_dose_leaves_rolling_window() {
    let (manager, clock) = setup();
    let (listener, _rx) = ChannelListener::new();
    let surface = manager.get_sound_dose_interface(Arc::new(listener)).unwrap();
    let processor = open_stream(&manager, 3, 1);

    processor.process(&second_at(100.0));
    assert!(surface.get_csd().unwrap() > 0.0);

    clock.advance(CSD_WINDOW_SECONDS + 2);
    assert_eq!(surface.get_csd().unwrap(), 0.0);
    assert!(surface.get_records().unwrap().is_empty());
    assert_eq!(manager.cached_mel_records_size(), 0);
}

#[test]
fn test_framework_mel_disabled() {
    let (manager, _clock) = setup();
    let (listener, _rx) = ChannelListener::new();
    let surface = manager.get_sound_dose_interface(Arc::new(listener)).unwrap();
    surface.force_use_framework_mel(false).unwrap();

    let processor = manager
        .get_or_create_processor_for_device(
            DeviceId(1),
            StreamHandle(10),
            SAMPLE_RATE,
            CHANNELS,
            AudioFormat::PcmFloat,
        )
        .unwrap();
    assert!(processor.is_none());
    assert_eq!(manager.active_processor_count(), 0);
}

#[test]
fn test_concurrent_streams_and_control() {
    let (manager, clock) = setup();
    let (listener, mut rx) = ChannelListener::new();
    let surface = manager.get_sound_dose_interface(Arc::new(listener)).unwrap();
    let processors: Vec<_> = (0..4).map(|i| open_stream(&manager, 100 + i, i + 1)).collect();
    let pcm = second_at(92.0);

    thread::scope(|scope| {
        for processor in &processors {
            let pcm = &pcm;
            scope.spawn(move || {
                for _ in 0..3 {
                    processor.process(pcm);
                }
            });
        }
        scope.spawn(|| {
            for rs2 in [85.0, 90.0, 95.0, 100.0] {
                surface.set_output_rs2(rs2).unwrap();
            }
        });
    });
    clock.advance(1);

    assert_eq!(surface.get_output_rs2().unwrap(), 100.0);
    assert!(processors.iter().all(|p| p.output_rs2() == 100.0));
    assert!(surface.get_csd().unwrap() > 0.0);
    // Every value landed on the same one-second slot
    assert_eq!(surface.get_records().unwrap().len(), 1);
    assert!(!drain(&mut rx).is_empty());
}

#[test]
fn test_concurrent_creation_for_same_stream_shares_processor() {
    const THREADS: usize = 8;
    let (manager, _clock) = setup();
    let barrier = Barrier::new(THREADS);

    let created: Vec<Arc<MelProcessor>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let manager = &manager;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    open_stream(manager, 77, 1)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("creator thread"))
            .collect()
    });

    let first = &created[0];
    assert!(created.iter().all(|processor| Arc::ptr_eq(processor, first)));
    assert_eq!(manager.active_processor_count(), 1);
    let registered = manager
        .processor_for_stream(StreamHandle(77))
        .expect("registered processor");
    assert!(Arc::ptr_eq(&registered, first));
}

#[test]
fn test_stalled_listener_does_not_block_processing() {
    let (manager, clock) = setup();
    let (listener, mut rx) = ChannelListener::with_capacity(2);
    let queue_view = listener.clone();
    let surface = manager.get_sound_dose_interface(Arc::new(listener)).unwrap();
    let processor = open_stream(&manager, 9, 1);

    // Nobody reads while ten seconds of loud audio are processed
    for _ in 0..10 {
        assert_eq!(processor.process(&second_at(101.0)), 1);
        clock.advance(1);
    }

    assert!(surface.is_active());
    assert_eq!(drain(&mut rx).len(), 2);
    assert_eq!(queue_view.dropped_events(), 18);
    assert_eq!(surface.get_records().unwrap().len(), 10);
}
