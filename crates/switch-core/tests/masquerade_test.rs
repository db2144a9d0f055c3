//! Masquerade seen from outside the crate

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use proptest::prelude::*;
use rvoip_switch_core::channel::{Datastore, FrameHook, FrameHookEvent};
use rvoip_switch_core::prelude::*;
use rvoip_switch_core::tech::mock::{MockEndpoint, MockTech};

fn setup() -> (Arc<ChannelRegistry>, Arc<MockTech>) {
    (
        ChannelRegistry::new(ChannelOptions::default()),
        Arc::new(MockTech::new("Mock")),
    )
}

struct PassThrough;

impl FrameHook for PassThrough {
    fn on_frame(&self, _event: FrameHookEvent, frame: Frame) -> Option<Frame> {
        Some(frame)
    }
}

#[tokio::test]
async fn test_masquerade_moves_the_call() {
    println!("🧪 Testing masquerade moves call state");
    let (registry, tech) = setup();
    let (dest, _) = tech.create(&registry, "Mock/holder").unwrap();
    let (src, src_ep) = tech.create(&registry, "Mock/caller").unwrap();

    src.set_caller(PartyId::new("1001", "Alice"));
    dest.set_caller(PartyId::number("0"));
    src.set_language("de");
    src.set_account_code("sales");
    src.queue_control(ControlKind::Ringing);
    dest.queue_control(ControlKind::Progress);
    src.attach_framehook(Arc::new(PassThrough));

    let fixups = Arc::new(AtomicUsize::new(0));
    let seen = fixups.clone();
    src.add_datastore(Datastore::new("call-log", 7u32).on_fixup(move |_, old, new| {
        assert!(old.is_zombie());
        assert!(!new.is_zombie());
        seen.fetch_add(1, Ordering::SeqCst);
    }));

    masquerade(&dest, &src).unwrap();

    assert_eq!(dest.name(), "Mock/caller");
    assert_eq!(dest.caller(), PartyId::new("1001", "Alice"));
    assert_eq!(src.caller(), PartyId::number("0"));
    assert_eq!(dest.language(), "de");
    assert_eq!(dest.account_code(), "sales");
    assert_eq!(dest.framehook_count(), 1);
    assert_eq!(src.framehook_count(), 0);
    assert_eq!(dest.datastore_count(), 1);
    assert_eq!(src.datastore_count(), 0);
    assert_eq!(fixups.load(Ordering::SeqCst), 1);

    // the source's frames come first
    let controls: Vec<FrameKind> = dest
        .queued_kinds()
        .into_iter()
        .filter(|k| matches!(k, FrameKind::Control(ControlKind::Ringing | ControlKind::Progress)))
        .collect();
    assert_eq!(
        controls,
        vec![
            FrameKind::Control(ControlKind::Ringing),
            FrameKind::Control(ControlKind::Progress)
        ]
    );

    let pvt = dest.tech_pvt().unwrap().downcast::<MockEndpoint>().unwrap();
    assert!(Arc::ptr_eq(&pvt, &src_ep));
    assert!(src.check_hangup());
    assert!(src.read().await.is_none());
}

#[tokio::test]
async fn test_destination_indication_replayed_to_moved_endpoint() {
    println!("🧪 Testing re-indication after masquerade");
    let (registry, tech) = setup();
    let (dest, dest_ep) = tech.create(&registry, "Mock/holder").unwrap();
    let (src, src_ep) = tech.create(&registry, "Mock/caller").unwrap();

    dest.indicate(ControlKind::Hold).unwrap();
    src.indicate(ControlKind::Ringing).unwrap();
    assert_eq!(dest_ep.indications(), vec![ControlKind::Hold]);

    masquerade(&dest, &src).unwrap();

    // the endpoint now behind dest hears what dest was last showing
    assert_eq!(
        src_ep.indications(),
        vec![ControlKind::Ringing, ControlKind::Hold, ControlKind::SrcChange]
    );
    assert_eq!(dest.visible_indication(), Some(ControlKind::Hold));
    assert_eq!(src.visible_indication(), None);
}

#[tokio::test]
async fn test_source_hangup_waits_for_masquerade() {
    let (registry, tech) = setup();
    let (dest, _) = tech.create(&registry, "Mock/dest").unwrap();
    let (src, src_ep) = tech.create(&registry, "Mock/src").unwrap();

    rvoip_switch_core::masquerade::plan(&dest, &src).unwrap();
    src.hangup().unwrap();
    assert!(!src.is_zombie());
    assert!(registry.find_by_name("Mock/src").is_some());

    // the destination's next read carries the masquerade out
    let frame = dest.read().await.unwrap();
    assert!(frame.is_null());
    assert_eq!(dest.name(), "Mock/src");
    assert!(src.is_zombie());
    assert!(registry.find_by_name("Mock/dest<ZOMBIE>").is_none());
    assert_eq!(src_ep.hangups(), 0);
}

#[tokio::test]
async fn test_failed_fixup_hangs_up_destination() {
    println!("🧪 Testing technology fixup failure");
    let (registry, tech) = setup();
    let (dest, _) = tech.create(&registry, "Mock/dest").unwrap();
    let (src, _) = tech.create(&registry, "Mock/src").unwrap();
    tech.set_fail_fixups(true);

    assert!(masquerade(&dest, &src).is_err());
    assert!(dest.check_hangup());
    assert!(src.is_zombie());
    // the swap itself is not rolled back
    assert_eq!(dest.name(), "Mock/src");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_variables_merge_keeping_destination_values(
        dest_vars in prop::collection::btree_map("[A-Z]{1,4}", "[a-z0-9]{0,6}", 0..6),
        src_vars in prop::collection::btree_map("[A-Z]{1,4}", "[a-z0-9]{0,6}", 0..6),
    ) {
        let (registry, tech) = setup();
        let (dest, _) = tech.create(&registry, "Mock/dest").unwrap();
        let (src, _) = tech.create(&registry, "Mock/src").unwrap();
        for (k, v) in &dest_vars {
            dest.set_variable(k.clone(), v.clone());
        }
        for (k, v) in &src_vars {
            src.set_variable(k.clone(), v.clone());
        }

        masquerade(&dest, &src).unwrap();

        let mut expected = src_vars.clone();
        expected.extend(dest_vars.clone());
        let merged: BTreeMap<String, String> = dest.variables().into_iter().collect();
        prop_assert_eq!(merged, expected);
    }

    #[test]
    fn prop_zombie_source_leaves_destination_untouched(
        vars in prop::collection::btree_map("[A-Z]{1,4}", "[a-z0-9]{1,6}", 0..4),
        name in "[a-z]{1,8}",
    ) {
        let (registry, tech) = setup();
        let (a, _) = tech.create(&registry, "Mock/a").unwrap();
        let (b, _) = tech.create(&registry, "Mock/b").unwrap();
        let (c, _) = tech.create(&registry, &format!("Other/{}", name)).unwrap();
        for (k, v) in &vars {
            c.set_variable(k.clone(), v.clone());
        }
        masquerade(&a, &b).unwrap();
        prop_assert!(b.is_zombie());

        let before = (c.name(), c.unique_id(), c.variables(), c.state());
        prop_assert!(masquerade(&c, &b).is_err());
        prop_assert!(masquerade(&b, &c).is_err());
        prop_assert_eq!(before, (c.name(), c.unique_id(), c.variables(), c.state()));
        prop_assert!(!c.is_zombie());
    }
}
