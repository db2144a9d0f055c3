//! Media building blocks working together

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rvoip_media_core::prelude::*;
use rvoip_media_core::translate::decode_to_slin;
use rvoip_media_core::JitterBufferStats;

#[test]
fn test_jitter_buffer_primes_then_drains() {
    println!("🧪 Testing jitter buffer priming");
    let jb = JitterBuffer::new(JitterBufferConfig::new(400, 40));

    jb.fill(&[1u8; 20]).unwrap();
    let mut out = [0u8; 64];
    assert_eq!(jb.drain(&mut out), 0);
    assert!(jb.is_priming());

    jb.fill(&[2u8; 20]).unwrap();
    assert_eq!(jb.drain(&mut out), 40);
    assert!(out[..20].iter().all(|b| *b == 1));
    assert!(out[20..40].iter().all(|b| *b == 2));

    // the reader caught up with the writer
    assert!(jb.is_priming());
    assert_eq!(jb.drain(&mut out), 0);
}

#[test]
fn test_jitter_buffer_overflow_keeps_newest_audio() {
    println!("🧪 Testing jitter buffer overflow resync");
    let jb = JitterBuffer::new(JitterBufferConfig::new(400, 40));
    let burst: Vec<u8> = (0..400u32).map(|i| (i % 256) as u8).collect();

    let err = jb.fill(&burst).unwrap_err();
    assert!(matches!(err, Error::JitterOverflow { discarded: 360 }));
    assert_eq!(jb.unread(), 40);
    assert_eq!(jb.drain(&mut [0u8; 10]), 0);

    jb.fill(&[0xaa; 40]).unwrap();
    let mut out = [0u8; 200];
    assert_eq!(jb.drain(&mut out), 80);
    let kept: Vec<u8> = (360..400u32).map(|i| (i % 256) as u8).collect();
    assert_eq!(&out[..40], kept.as_slice());
    assert!(out[40..80].iter().all(|b| *b == 0xaa));

    let stats = jb.stats();
    assert_eq!(stats.overflows, 1);
    assert_eq!(stats.bytes_discarded, 360);
}

#[test]
fn test_misconfigured_jitter_buffer_is_normalized() {
    let jb = JitterBuffer::new(JitterBufferConfig::new(10, 50));
    assert!(jb.capacity() >= 100);
    assert!(jb.upper_threshold() < jb.capacity());
}

#[test]
fn test_jitter_buffer_preserves_order_under_bursts() {
    println!("🧪 Testing jitter buffer with random bursts");
    let jb = JitterBuffer::new(JitterBufferConfig::new(1000, 100));
    let mut rng = StdRng::seed_from_u64(7);
    let mut written = Vec::new();
    let mut drained = Vec::new();
    let mut next = 0u8;

    for _ in 0..500 {
        let len = rng.gen_range(1..80);
        if jb.unread() + len < jb.capacity() {
            let chunk: Vec<u8> = (0..len)
                .map(|_| {
                    next = next.wrapping_add(1);
                    next
                })
                .collect();
            jb.fill(&chunk).unwrap();
            written.extend(chunk);
        }
        let mut out = vec![0u8; rng.gen_range(1..80)];
        let n = jb.drain(&mut out);
        drained.extend_from_slice(&out[..n]);
    }
    let mut out = vec![0u8; 1000];
    let n = jb.drain(&mut out);
    drained.extend_from_slice(&out[..n]);

    assert_eq!(&written[..drained.len()], drained.as_slice());
    // whatever is left is still priming
    assert!(written.len() - drained.len() < jb.upper_threshold());
    assert_eq!(jb.stats().overflows, 0);
}

#[test]
fn test_jitter_config_and_stats_as_json() {
    let config: JitterBufferConfig = serde_json::from_str(r#"{"size": 2000}"#).unwrap();
    assert_eq!(config.size, 2000);
    assert_eq!(config.upper_threshold, JitterBufferConfig::default().upper_threshold);

    let jb = JitterBuffer::new(config);
    jb.fill(&[0u8; 600]).unwrap();
    let json = serde_json::to_value(jb.stats()).unwrap();
    assert_eq!(json["bytes_filled"], 600);
    let back: JitterBufferStats = serde_json::from_value(json).unwrap();
    assert_eq!(back, jb.stats());
}

#[test]
fn test_translate_and_decode_ulaw() {
    let mut encode = TranslatorPath::build(Format::Slin8, Format::Ulaw).unwrap();
    assert_eq!(encode.steps(), 1);

    let pcm: Vec<i16> = (0..160).map(|i| ((i % 40) as i16 - 20) * 400).collect();
    let frames = encode.translate(Frame::from_slin(Format::Slin8, &pcm)).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].format(), Some(Format::Ulaw));
    assert_eq!(frames[0].data.len(), 160);
    assert_eq!(frames[0].samples, 160);

    let decoded = decode_to_slin(&frames[0]).unwrap();
    for (a, b) in pcm.iter().zip(decoded.iter()) {
        // companding error stays within a few percent of full scale
        assert!((*a as i32 - *b as i32).abs() < 600, "{} vs {}", a, b);
    }

    // ulaw to alaw goes through signed linear
    let transcode = TranslatorPath::build(Format::Ulaw, Format::Alaw).unwrap();
    assert_eq!(transcode.steps(), 2);
    assert!(TranslatorPath::build(Format::Ulaw, Format::Ulaw).is_err());
    assert!(decode_to_slin(&Frame::text("hello")).is_none());
}

#[test]
fn test_detect_digit_carried_as_ulaw() {
    println!("🧪 Testing in-band DTMF through G.711");
    let mut tones = ToneList::parse(&DtmfDigit::Seven.tone_spec(), 8000).unwrap();
    let mut encode = TranslatorPath::build(Format::Slin8, Format::Ulaw).unwrap();
    let mut detector = DtmfDetector::new();
    let mut events = Vec::new();

    // 200 ms of tone then 200 ms of silence, 20 ms per frame
    for i in 0..20 {
        let pcm = if i < 10 { tones.generate(160) } else { vec![0i16; 160] };
        for frame in encode.translate(Frame::from_slin(Format::Slin8, &pcm)).unwrap() {
            let samples = decode_to_slin(&frame).unwrap();
            events.extend(detector.process(&samples));
        }
    }

    assert_eq!(events.first(), Some(&DtmfEvent::Begin(DtmfDigit::Seven)), "events: {:?}", events);
    assert!(
        matches!(events.last(), Some(DtmfEvent::End(DtmfDigit::Seven, _))),
        "events: {:?}",
        events
    );
}

#[test]
fn test_frames_describe_themselves() {
    let end = Frame::dtmf_end(DtmfDigit::Pound, 120);
    assert_eq!(end.digit(), Some(DtmfDigit::Pound));
    assert_eq!(end.duration_ms, 120);
    assert!(!end.is_voice());

    let hangup = Frame::hangup(16);
    assert_eq!(hangup.control_kind(), Some(ControlKind::Hangup));
    assert_eq!(hangup.hangup_cause(), Some(16));

    assert!(FrameKind::Voice(Format::Ulaw).is_prunable());
    assert!(!FrameKind::Control(ControlKind::Ringing).is_prunable());
}
