//! Call pickup
//!
//! A channel whose pickup group shares a bit with a ringing channel's call
//! group may answer that call in its place. The picker is answered, and the
//! ringing channel takes over the picker's endpoint by masquerade, so
//! whoever placed the call sees it answered.

use std::sync::Arc;

use rvoip_media_core::ControlKind;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelState};
use crate::error::{Result, SwitchError};
use crate::masquerade;

/// Whether `picker` may pick up `target`
pub fn can_pickup(picker: &Arc<Channel>, target: &Arc<Channel>) -> bool {
    !Arc::ptr_eq(picker, target)
        && !target.check_hangup()
        && !target.masquerade_involved()
        && target.bridged_peer().is_none()
        && matches!(target.state(), ChannelState::Ring | ChannelState::Ringing)
        && picker.pickup_group() & target.call_group() != 0
}

/// Oldest ringing channel `picker` may pick up
pub fn find_target(picker: &Arc<Channel>) -> Option<Arc<Channel>> {
    let registry = picker.registry()?;
    registry
        .channels()
        .into_iter()
        .find(|candidate| can_pickup(picker, candidate))
}

/// Pick up a ringing call for `picker`. Returns the channel that was picked up.
pub fn pickup(picker: &Arc<Channel>) -> Result<Arc<Channel>> {
    let Some(target) = find_target(picker) else {
        debug!("No call pickup possible for {}", picker.name());
        return Err(SwitchError::pickup(format!("nothing for {} to pick up", picker.name())));
    };
    pickup_channel(picker, &target)?;
    Ok(target)
}

/// Pick up `target` for `picker`
pub fn pickup_channel(picker: &Arc<Channel>, target: &Arc<Channel>) -> Result<()> {
    if !can_pickup(picker, target) {
        return Err(SwitchError::pickup(format!(
            "{} cannot pick up {}",
            picker.name(),
            target.name()
        )));
    }
    let (picker_name, target_name) = (picker.name(), target.name());
    debug!("Call pickup on {} by {}", target_name, picker_name);

    if let Err(e) = picker.answer() {
        warn!("Unable to answer {}: {}", picker_name, e);
    }
    // moves to the target with the rest of the picker's queue
    if !picker.queue_control(ControlKind::Answer) {
        warn!("Unable to queue answer on {}", picker_name);
    }
    target.set_connected(picker.caller());

    masquerade::masquerade(target, picker)?;
    info!("📞 {} picked up {}", picker_name, target_name);
    Ok(())
}

impl Channel {
    /// Planned or running as either side of a masquerade
    pub(crate) fn masquerade_involved(&self) -> bool {
        self.inner.lock().masq.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelOptions;
    use crate::registry::ChannelRegistry;
    use crate::tech::mock::MockTech;

    #[tokio::test]
    async fn test_pickup_matches_groups() {
        println!("🧪 Testing call pickup");
        let registry = ChannelRegistry::new(ChannelOptions::default());
        let tech = Arc::new(MockTech::new("Mock"));
        let (picker, picker_ep) = tech.create(&registry, "Mock/picker").unwrap();
        let (other, _) = tech.create(&registry, "Mock/other-group").unwrap();
        let (ringing, ringing_ep) = tech.create(&registry, "Mock/ringing").unwrap();

        picker.set_groups(0, 0b0010);
        other.set_groups(0b0100, 0);
        other.set_state(ChannelState::Ringing);
        ringing.set_groups(0b0010, 0);

        // not ringing yet
        assert!(matches!(pickup(&picker), Err(SwitchError::Pickup(_))));

        ringing.set_state(ChannelState::Ringing);
        let target = pickup(&picker).unwrap();
        assert!(Arc::ptr_eq(&target, &ringing));
        assert!(picker.is_zombie());
        assert_eq!(ringing.name(), "Mock/picker");
        assert_eq!(ringing.state(), ChannelState::Up);
        assert_eq!(ringing_ep.hangups(), 1);
        assert_eq!(picker_ep.hangups(), 0);
        assert!(ringing.queued_kinds().contains(&rvoip_media_core::FrameKind::Control(ControlKind::Answer)));
    }
}
