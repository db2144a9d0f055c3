//! Channel queue and read pipeline behaviour seen from outside the crate

use std::sync::Arc;
use std::time::Duration;

use rvoip_switch_core::generator::SilenceGenerator;
use rvoip_switch_core::prelude::*;
use rvoip_switch_core::tech::mock::MockTech;
use rvoip_switch_core::tech::TechProperties;
use serial_test::serial;
use tokio::time::Instant;

fn setup() -> (Arc<ChannelRegistry>, Arc<MockTech>) {
    (
        ChannelRegistry::new(ChannelOptions::default()),
        Arc::new(MockTech::new("Mock")),
    )
}

fn silence() -> Frame {
    Frame::voice(Format::Ulaw, vec![0xffu8; 160], 160)
}

/// Read until something other than a no-op frame comes up
async fn read_significant(channel: &Arc<Channel>) -> Option<Frame> {
    loop {
        match channel.read().await {
            Some(frame) if frame.is_null() => continue,
            other => return other,
        }
    }
}

#[tokio::test]
async fn test_queue_is_bounded() {
    println!("🧪 Testing voice queue pruning");
    let (registry, tech) = setup();
    let (chan, _) = tech.create(&registry, "Mock/flood").unwrap();

    for _ in 0..200 {
        assert!(chan.queue_frame(silence()));
    }

    // pruned twice, 64 frames each time
    assert_eq!(chan.queued_frames(), 72);
    assert_eq!(chan.dropped_frames(), 128);
}

#[tokio::test]
async fn test_control_frames_survive_pruning() {
    let (registry, tech) = setup();
    let (chan, _) = tech.create(&registry, "Mock/flood").unwrap();

    chan.queue_control(ControlKind::Ringing);
    for _ in 0..120 {
        chan.queue_frame(silence());
    }
    let kinds = chan.queued_kinds();
    assert_eq!(kinds[0], FrameKind::Control(ControlKind::Ringing));
    assert!(kinds.len() < 121);
}

#[tokio::test]
async fn test_nothing_queues_behind_hangup() {
    println!("🧪 Testing hangup ends the queue");
    let (registry, tech) = setup();
    let (chan, _) = tech.create(&registry, "Mock/gone").unwrap();

    chan.queue_frame(silence());
    assert!(chan.queue_hangup(Some(17)));
    assert!(!chan.queue_frame(silence()));
    assert!(chan.check_hangup());

    assert!(chan.read().await.is_none());
    assert_eq!(chan.hangup_cause(), 17);
}

#[tokio::test(start_paused = true)]
async fn test_end_only_digit_is_emulated() {
    println!("🧪 Testing DTMF begin/end emulation");
    let (registry, tech) = setup();
    let (chan, _) = tech.create(&registry, "Mock/keypad").unwrap();

    chan.queue_frame(Frame::dtmf_end(DtmfDigit::Five, 0));

    let started = Instant::now();
    let begin = read_significant(&chan).await.unwrap();
    assert_eq!(begin.kind, FrameKind::DtmfBegin(DtmfDigit::Five));

    let end = read_significant(&chan).await.unwrap();
    assert_eq!(end.kind, FrameKind::DtmfEnd(DtmfDigit::Five));
    assert!(end.duration_ms >= MIN_DTMF_DURATION_MS);
    assert!(started.elapsed() >= Duration::from_millis(DEFAULT_EMULATE_DTMF_DURATION_MS as u64));
}

#[tokio::test(start_paused = true)]
async fn test_digits_keep_their_gap() {
    println!("🧪 Testing minimum gap between digits");
    let (registry, tech) = setup();
    let (chan, _) = tech.create(&registry, "Mock/keypad").unwrap();
    chan.set_end_dtmf_only(true);

    chan.queue_frames(vec![
        Frame::dtmf_end(DtmfDigit::One, 120),
        Frame::dtmf_end(DtmfDigit::Two, 120),
    ]);

    let first = read_significant(&chan).await.unwrap();
    let first_at = Instant::now();
    assert_eq!(first.digit(), Some(DtmfDigit::One));
    assert_eq!(first.duration_ms, 120);

    let second = read_significant(&chan).await.unwrap();
    assert_eq!(second.digit(), Some(DtmfDigit::Two));
    assert!(first_at.elapsed() >= Duration::from_millis(MIN_DTMF_GAP_MS as u64));
}

#[tokio::test(start_paused = true)]
async fn test_short_digit_is_stretched() {
    let (registry, tech) = setup();
    let (chan, _) = tech.create(&registry, "Mock/keypad").unwrap();
    chan.set_end_dtmf_only(true);

    chan.queue_frame(Frame::dtmf_end(DtmfDigit::Star, 10));
    let frame = read_significant(&chan).await.unwrap();
    assert_eq!(frame.digit(), Some(DtmfDigit::Star));
    assert_eq!(frame.duration_ms, MIN_DTMF_DURATION_MS);
}

#[tokio::test(start_paused = true)]
async fn test_deferred_digits_wait_for_undefer() {
    println!("🧪 Testing deferred DTMF");
    let (registry, tech) = setup();
    let (chan, _) = tech.create(&registry, "Mock/keypad").unwrap();
    chan.set_end_dtmf_only(true);
    assert!(!chan.defer_dtmf());

    chan.queue_frames(vec![Frame::dtmf_end(DtmfDigit::Nine, 100), silence()]);

    // the voice frame overtakes the held digit
    let frame = read_significant(&chan).await.unwrap();
    assert!(frame.is_voice());
    assert_eq!(chan.queued_kinds(), vec![FrameKind::DtmfEnd(DtmfDigit::Nine)]);

    chan.undefer_dtmf();
    let frame = read_significant(&chan).await.unwrap();
    assert_eq!(frame.digit(), Some(DtmfDigit::Nine));
}

#[tokio::test]
async fn test_read_wakes_on_queue() {
    let (registry, tech) = setup();
    let (chan, _) = tech.create(&registry, "Mock/waiter").unwrap();

    let mut read = tokio_test::task::spawn(chan.read());
    tokio_test::assert_pending!(read.poll());

    chan.queue_control(ControlKind::Progress);
    assert!(read.is_woken());
    let frame = tokio_test::assert_ready!(read.poll()).unwrap();
    assert_eq!(frame.control_kind(), Some(ControlKind::Progress));
}

#[tokio::test(start_paused = true)]
async fn test_generator_paced_by_core_timer() {
    println!("🧪 Testing generator pacing without a voice-paced technology");
    let (registry, tech) = setup();
    let (chan, endpoint) = tech.create(&registry, "Mock/timer").unwrap();

    chan.activate_generator(Box::new(SilenceGenerator)).unwrap();
    tokio::time::sleep(Duration::from_millis(110)).await;

    // nobody reads, the core task still writes every cadence
    assert!(endpoint.written().len() >= 5);
    chan.deactivate_generator();
}

#[tokio::test(start_paused = true)]
async fn test_voice_paced_generator_waits_for_reads() {
    println!("🧪 Testing generator pacing by received voice");
    let registry = ChannelRegistry::new(ChannelOptions::default());
    let tech = Arc::new(MockTech::new("Mock").with_properties(TechProperties {
        paced_by_voice: true,
        ..Default::default()
    }));
    let (chan, endpoint) = tech.create(&registry, "Mock/voice").unwrap();

    chan.activate_generator(Box::new(SilenceGenerator)).unwrap();
    tokio::time::sleep(Duration::from_millis(110)).await;
    assert!(endpoint.written().is_empty());

    chan.queue_frame(silence());
    let frame = chan.read().await.unwrap();
    assert!(frame.is_voice());
    assert_eq!(endpoint.written().len(), 1);
}

#[tokio::test]
#[serial]
async fn test_global_registry_lookup_and_hangup() {
    println!("🧪 Testing the global registry");
    let registry = ChannelRegistry::global();
    let tech = Arc::new(MockTech::new("Mock"));
    let before = registry.len();

    let (chan, endpoint) = tech.create(&registry, "Mock/global-1").unwrap();
    assert!(Arc::ptr_eq(&registry.find_by_name("Mock/global-1").unwrap(), &chan));
    assert!(Arc::ptr_eq(&registry.find_by_unique_id(&chan.unique_id()).unwrap(), &chan));
    assert!(tech.create(&registry, "Mock/global-1").is_err());

    chan.hangup().unwrap();
    assert!(registry.find_by_name("Mock/global-1").is_none());
    assert_eq!(registry.len(), before);
    assert_eq!(endpoint.hangups(), 1);
    assert!(chan.read().await.is_none());
}

#[tokio::test]
#[serial]
async fn test_global_registry_requests_through_driver() {
    let registry = ChannelRegistry::global();
    let tech = Arc::new(MockTech::new("MockOut"));
    registry.register_driver(tech.clone());

    let chan = registry.request("MockOut", "bob", FormatSet::from_formats(&[Format::Ulaw])).unwrap();
    assert!(chan.name().starts_with("MockOut/bob-"));
    assert!(chan.is_outgoing());
    assert_eq!(registry.by_technology("mockout").len(), 1);

    assert!(registry.request("Nope", "bob", FormatSet::from_formats(&[Format::Ulaw])).is_err());

    chan.hangup().unwrap();
    assert!(registry.unregister_driver("MockOut"));
}
