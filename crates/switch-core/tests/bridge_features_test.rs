//! Bridging with feature codes, parking, pickup and blind transfer

use std::sync::Arc;
use std::time::Duration;

use rvoip_media_core::translate::decode_to_slin;
use rvoip_media_core::{DtmfDetector, DtmfEvent};
use rvoip_switch_core::config::FeaturesConfig;
use rvoip_switch_core::parking::PARKING_SLOT_VAR;
use rvoip_switch_core::prelude::*;
use rvoip_switch_core::tech::holding::HoldingTech;
use rvoip_switch_core::tech::mock::{MockEndpoint, MockTech};
use rvoip_switch_core::transfer::{ATTENDED_TRANSFER_VAR, BLIND_TRANSFER_VAR};
use tokio::task::JoinHandle;

struct Call {
    registry: Arc<ChannelRegistry>,
    tech: Arc<MockTech>,
    alice: Arc<Channel>,
    bob: Arc<Channel>,
    bob_ep: Arc<MockEndpoint>,
}

fn call() -> Call {
    let registry = ChannelRegistry::new(ChannelOptions::default());
    let tech = Arc::new(MockTech::new("Mock").with_native_digits(true));
    let (alice, _) = tech.create(&registry, "Mock/alice").unwrap();
    let (bob, bob_ep) = tech.create(&registry, "Mock/bob").unwrap();
    Call {
        registry,
        tech,
        alice,
        bob,
        bob_ep,
    }
}

/// `*8` picks up, `**` disconnects, `#` transfers, `*2` parks
fn features_config() -> FeaturesConfig {
    FeaturesConfig {
        disconnect: "**".to_string(),
        blindxfer: "#".to_string(),
        parkcall: "*2".to_string(),
        pickup: "*8".to_string(),
        ..Default::default()
    }
}

fn caller_features(features: FeatureMap) -> BridgeConfig {
    BridgeConfig {
        caller_features: FeaturePermissions::all(),
        ..BridgeConfig::new(Arc::new(features))
    }
}

fn start(call: &Call, config: BridgeConfig) -> JoinHandle<Result<BridgeOutcome>> {
    let (alice, bob) = (call.alice.clone(), call.bob.clone());
    tokio::spawn(async move { bridge(&alice, &bob, &config).await })
}

fn dial(channel: &Arc<Channel>, digits: &str) {
    let frames = digits
        .chars()
        .map(|c| Frame::dtmf_end(DtmfDigit::from_char(c).unwrap(), 100))
        .collect();
    assert!(channel.queue_frames(frames));
}

fn digits_sent(endpoint: &MockEndpoint) -> String {
    endpoint.log().digits_ended.iter().map(|(d, _)| d.as_char()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_unmapped_digits_are_relayed() {
    println!("🧪 Testing relay of digits that are no feature");
    let call = call();
    let features = FeatureMap::from_config(&features_config()).unwrap();
    let task = start(&call, caller_features(features));
    tokio::task::yield_now().await;

    dial(&call.alice, "*5");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(digits_sent(&call.bob_ep), "*5");
    assert_eq!(call.bob_ep.log().digits_begun.len(), 2);

    // bob has no features: his digits go straight through
    dial(&call.bob, "*8");
    tokio::time::sleep(Duration::from_millis(300)).await;
    call.alice.queue_hangup(None);

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, BridgeOutcome::Hangup { side: Side::Caller });
    assert!(call.alice.bridged_peer().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_replayed_digits_play_in_band_on_peer() {
    println!("🧪 Testing replayed digits towards a peer without native digits");
    let registry = ChannelRegistry::new(ChannelOptions::default());
    let tech = Arc::new(MockTech::new("Mock"));
    let (alice, _) = tech.create(&registry, "Mock/alice").unwrap();
    let (bob, bob_ep) = tech.create(&registry, "Mock/bob").unwrap();
    let config = caller_features(FeatureMap::from_config(&features_config()).unwrap());
    let task = {
        let (alice, bob) = (alice.clone(), bob.clone());
        tokio::spawn(async move { bridge(&alice, &bob, &config).await })
    };
    tokio::task::yield_now().await;

    // `*` is held as a prefix, then both digits are replayed back to back
    dial(&alice, "*5");
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut detector = DtmfDetector::new();
    let heard: String = bob_ep
        .written()
        .iter()
        .filter_map(decode_to_slin)
        .flat_map(|pcm| detector.process(&pcm))
        .filter_map(|event| match event {
            DtmfEvent::Begin(digit) => Some(digit.as_char()),
            DtmfEvent::End(..) => None,
        })
        .collect();
    assert_eq!(heard, "*5");
    assert!(bob_ep.log().digits_ended.is_empty());

    bob.queue_hangup(None);
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, BridgeOutcome::Hangup { side: Side::Callee });
}

#[tokio::test(start_paused = true)]
async fn test_prefix_is_held_then_replayed_on_timeout() {
    println!("🧪 Testing feature digit timeout");
    let call = call();
    let features = FeatureMap::from_config(&features_config()).unwrap();
    let timeout = features.digit_timeout();
    let task = start(&call, caller_features(features));
    tokio::task::yield_now().await;

    dial(&call.alice, "*");
    tokio::time::sleep(timeout / 2).await;
    assert_eq!(digits_sent(&call.bob_ep), "");

    tokio::time::sleep(timeout).await;
    let sent = call.bob_ep.log().digits_ended;
    assert_eq!(sent, vec![(DtmfDigit::Star, 100)]);

    call.bob.queue_hangup(None);
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, BridgeOutcome::Hangup { side: Side::Callee });
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_code_ends_the_bridge() {
    let call = call();
    let features = FeatureMap::from_config(&features_config()).unwrap();
    let task = start(&call, caller_features(features));
    tokio::task::yield_now().await;

    dial(&call.alice, "**");
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        BridgeOutcome::FeatureTerminated {
            feature: "disconnect".to_string(),
            side: Side::Caller
        }
    );
    assert!(call.alice.check_hangup());
    assert!(!call.bob.check_hangup());
    assert_eq!(digits_sent(&call.bob_ep), "");
}

#[tokio::test(start_paused = true)]
async fn test_pickup_code_takes_a_ringing_call() {
    println!("🧪 Testing *8 call pickup from a bridge");
    let call = call();
    let (carol, carol_ep) = call.tech.create(&call.registry, "Mock/carol").unwrap();
    carol.set_groups(0b0001, 0);
    carol.set_state(ChannelState::Ringing);
    call.alice.set_groups(0, 0b0001);

    let features = FeatureMap::from_config(&features_config()).unwrap();
    let task = start(&call, caller_features(features));
    tokio::task::yield_now().await;

    dial(&call.alice, "*8");
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        BridgeOutcome::FeatureTerminated {
            feature: "pickup".to_string(),
            side: Side::Caller
        }
    );

    // carol's channel now talks to alice's endpoint
    assert!(call.alice.is_zombie());
    assert_eq!(carol.name(), "Mock/alice");
    assert_eq!(carol.state(), ChannelState::Up);
    assert_eq!(carol_ep.hangups(), 1);
    assert!(call.bob.bridged_peer().is_none());
    assert_eq!(digits_sent(&call.bob_ep), "");
}

#[tokio::test(start_paused = true)]
async fn test_pickup_without_target_keeps_bridging() {
    let call = call();
    let features = FeatureMap::from_config(&features_config()).unwrap();
    let task = start(&call, caller_features(features));
    tokio::task::yield_now().await;

    dial(&call.alice, "*8");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!task.is_finished());
    assert!(!call.alice.is_zombie());

    call.alice.queue_hangup(None);
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, BridgeOutcome::Hangup { side: Side::Caller });
}

#[tokio::test(start_paused = true)]
async fn test_blind_transfer_sends_peer_to_extension() {
    println!("🧪 Testing blind transfer");
    let call = call();
    let features = FeatureMap::from_config(&features_config()).unwrap();
    let task = start(&call, caller_features(features));
    tokio::task::yield_now().await;

    dial(&call.alice, "#2000#");
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        BridgeOutcome::Transfer {
            transferee: Side::Callee,
            exten: "2000".to_string()
        }
    );

    let location = call.bob.location();
    assert_eq!(location.exten, "2000");
    assert_eq!(location.priority, 1);
    assert_eq!(call.bob.variable(BLIND_TRANSFER_VAR).as_deref(), Some("Mock/alice"));
    assert!(call.bob_ep.indications().contains(&ControlKind::Hold));
    assert!(call.bob.bridged_peer().is_none());
}

/// `*3` starts an attended transfer dialled through the mock driver
fn atxfer_config() -> FeaturesConfig {
    FeaturesConfig {
        atxfer: "*3".to_string(),
        atxfer_tech: "Mock".to_string(),
        ..features_config()
    }
}

/// Dial `*3<exten>#` as alice and answer the target the transfer requests
async fn consult(call: &Call, exten: &str) -> Arc<Channel> {
    dial(&call.alice, &format!("*3{}#", exten));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut requested = call.registry.find_by_name_prefix(&format!("Mock/{}@default", exten));
    assert_eq!(requested.len(), 1);
    let target = requested.remove(0);
    assert_eq!(target.state(), ChannelState::Ringing);

    assert!(target.queue_frame(Frame::control(ControlKind::Answer)));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(target.state(), ChannelState::Up);
    target
}

#[tokio::test(start_paused = true)]
async fn test_attended_transfer_hands_peer_to_target() {
    println!("🧪 Testing attended transfer completed by the transferer hanging up");
    let call = call();
    call.registry.register_driver(call.tech.clone());
    let features = FeatureMap::from_config(&atxfer_config()).unwrap();
    let task = start(&call, caller_features(features));
    tokio::task::yield_now().await;

    let target = consult(&call, "200").await;
    assert!(call.bob_ep.indications().contains(&ControlKind::Hold));
    assert!(call.alice.bridged_peer().is_some_and(|p| Arc::ptr_eq(&p, &target)));

    call.alice.queue_hangup(None);
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        BridgeOutcome::FeatureTerminated {
            feature: "atxfer".to_string(),
            side: Side::Caller
        }
    );
    tokio::time::sleep(Duration::from_millis(1)).await;

    // bob's endpoint now lives in the holder, which took bob's name
    let holder = call.registry.find_by_name("Mock/bob").unwrap();
    assert!(!Arc::ptr_eq(&holder, &call.bob));
    assert!(call.bob.is_zombie());
    assert!(call.bob.name().starts_with(HoldingTech::TRANSFERRED_PREFIX));
    assert_eq!(holder.variable(ATTENDED_TRANSFER_VAR).as_deref(), Some("Mock/alice"));
    assert!(holder.bridged_peer().is_some_and(|p| Arc::ptr_eq(&p, &target)));
    assert!(call
        .bob_ep
        .indications()
        .ends_with(&[ControlKind::Hold, ControlKind::Unhold, ControlKind::SrcChange]));

    let before = call.bob_ep.written().len();
    target.queue_frame(Frame::voice(Format::Ulaw, vec![0xffu8; 160], 160));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(call.bob_ep.written().len(), before + 1);

    target.queue_hangup(None);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(call.bob_ep.hangups(), 1);
    assert!(call.registry.find_by_name("Mock/bob").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_attended_transfer_abandoned_when_target_leaves() {
    println!("🧪 Testing attended transfer abandoned by the target");
    let call = call();
    call.registry.register_driver(call.tech.clone());
    let features = FeatureMap::from_config(&atxfer_config()).unwrap();
    let task = start(&call, caller_features(features));
    tokio::task::yield_now().await;

    let target = consult(&call, "300").await;
    target.queue_hangup(None);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // back to the original call
    assert_eq!(call.bob_ep.indications().last(), Some(&ControlKind::Unhold));
    assert!(call.alice.bridged_peer().is_some_and(|p| Arc::ptr_eq(&p, &call.bob)));
    assert!(!call.bob.is_zombie());

    let before = call.bob_ep.written().len();
    call.alice.queue_frame(Frame::voice(Format::Ulaw, vec![0xffu8; 160], 160));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(call.bob_ep.written().len(), before + 1);

    call.alice.queue_hangup(None);
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, BridgeOutcome::Hangup { side: Side::Caller });
}

#[tokio::test(start_paused = true)]
async fn test_attended_transfer_to_unreachable_target_resumes_call() {
    let call = call();
    // no driver registered for the mock technology
    let features = FeatureMap::from_config(&atxfer_config()).unwrap();
    let task = start(&call, caller_features(features));
    tokio::task::yield_now().await;

    dial(&call.alice, "*3400#");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        call.bob_ep.indications(),
        vec![ControlKind::Hold, ControlKind::Unhold]
    );
    assert!(call.alice.bridged_peer().is_some_and(|p| Arc::ptr_eq(&p, &call.bob)));

    call.bob.queue_hangup(None);
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, BridgeOutcome::Hangup { side: Side::Callee });
}

#[tokio::test(start_paused = true)]
async fn test_park_code_parks_the_peer() {
    println!("🧪 Testing parking from a bridge");
    let call = call();
    let config = SwitchConfig::default();
    let lot = ParkingLot::new(call.registry.clone(), &config.parking);
    let features = FeatureMap::from_config(&features_config())
        .unwrap()
        .with_parking(lot.clone());
    let (alice_ep, bob_ep) = (
        call.tech.endpoint("Mock/alice").unwrap(),
        call.bob_ep.clone(),
    );
    let task = start(&call, caller_features(features));
    tokio::task::yield_now().await;

    dial(&call.alice, "*2");
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        BridgeOutcome::FeatureTerminated {
            feature: "parkcall".to_string(),
            side: Side::Caller
        }
    );

    let slot = config.parking.first_slot;
    assert_eq!(lot.len(), 1);
    assert_eq!(call.alice.variable(PARKING_SLOT_VAR), Some(slot.to_string()));
    assert_eq!(alice_ep.log().texts, vec![format!("Parked at {}", slot)]);

    // bob's endpoint now belongs to the holding channel
    assert!(call.bob.is_zombie());
    let parked = lot.get(slot).unwrap();
    assert_eq!(parked.channel.name(), "Mock/bob");
    let pvt = parked.channel.tech_pvt().unwrap().downcast::<MockEndpoint>().unwrap();
    assert!(Arc::ptr_eq(&pvt, &bob_ep));
    assert!(bob_ep.indications().contains(&ControlKind::Hold));

    let back = lot.unpark(slot).unwrap();
    assert!(Arc::ptr_eq(&back, &parked.channel));
    assert!(lot.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_feature_without_permission_is_relayed() {
    let call = call();
    let features = FeatureMap::from_config(&features_config()).unwrap();
    let config = BridgeConfig {
        caller_features: FeaturePermissions {
            disconnect: false,
            ..FeaturePermissions::all()
        },
        ..BridgeConfig::new(Arc::new(features))
    };
    let task = start(&call, config);
    tokio::task::yield_now().await;

    // `*` stays a prefix of *2 and *8, the second `*` ends the match
    dial(&call.alice, "**");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(digits_sent(&call.bob_ep), "**");
    assert!(!call.alice.check_hangup());

    call.alice.queue_hangup(None);
    task.await.unwrap().unwrap();
}
