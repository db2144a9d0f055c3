//! Blind and attended transfer, and digit collection

use std::sync::Arc;
use std::time::Duration;

use rvoip_media_core::{ControlKind, DtmfDigit, FrameKind};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bridge::{bridge, BridgeConfig};
use crate::channel::{Channel, ChannelState};
use crate::error::{Result, SwitchError};
use crate::tech::holding::HoldingTech;

/// Variable naming who blind transferred a channel
pub const BLIND_TRANSFER_VAR: &str = "BLINDTRANSFER";
/// Variable on the transferer overriding the context transfers go to
pub const TRANSFER_CONTEXT_VAR: &str = "TRANSFER_CONTEXT";
/// Variable naming who handed a channel over in an attended transfer
pub const ATTENDED_TRANSFER_VAR: &str = "ATTENDEDTRANSFER";

/// Collect up to `max` digits from `channel`
///
/// Stops at `#` (not included), after `max` digits, or when no digit
/// arrives within `timeout` of the previous one. Other frames are dropped.
pub async fn read_digits(channel: &Arc<Channel>, max: usize, timeout: Duration) -> Result<String> {
    let mut digits = String::new();
    while digits.len() < max {
        let frame = match tokio::time::timeout(timeout, channel.read()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(SwitchError::ChannelGone(channel.name())),
            Err(_) => {
                debug!("Digit timeout on {} after {:?}", channel.name(), digits);
                break;
            }
        };
        if let FrameKind::DtmfEnd(digit) = frame.kind {
            if digit == DtmfDigit::Pound {
                break;
            }
            digits.push(digit.as_char());
        }
    }
    Ok(digits)
}

/// Send `transferee` to `exten` on behalf of `transferer`
///
/// The extension is looked up in the transferer's `TRANSFER_CONTEXT`, or
/// else its current context.
pub fn blind_transfer(transferee: &Arc<Channel>, transferer: &Arc<Channel>, exten: &str) -> Result<()> {
    if exten.is_empty() {
        return Err(SwitchError::feature("empty transfer target"));
    }
    if transferee.check_hangup() {
        return Err(SwitchError::ChannelGone(transferee.name()));
    }
    let context = transferer
        .variable(TRANSFER_CONTEXT_VAR)
        .unwrap_or_else(|| transferer.location().context);

    transferee.set_variable(BLIND_TRANSFER_VAR, transferer.name());
    transferee.set_location(context.clone(), exten, 1);
    info!("Blind transfer of {} to {}@{} by {}", transferee.name(), exten, context, transferer.name());
    Ok(())
}

/// Context an attended transfer dials in: `TRANSFER_CONTEXT` of the
/// transferee, then of the transferer, else the transferer's context
pub fn transfer_context(transferee: &Arc<Channel>, transferer: &Arc<Channel>) -> String {
    transferee
        .variable(TRANSFER_CONTEXT_VAR)
        .or_else(|| transferer.variable(TRANSFER_CONTEXT_VAR))
        .unwrap_or_else(|| transferer.location().context)
}

/// Request `exten@context` from the `tech` driver and wait for it to answer
pub async fn dial_target(
    transferer: &Arc<Channel>,
    tech: &str,
    exten: &str,
    context: &str,
    timeout: Duration,
) -> Result<Arc<Channel>> {
    let registry = transferer
        .registry()
        .ok_or_else(|| SwitchError::feature(format!("{} has no registry to dial from", transferer.name())))?;
    let data = format!("{}@{}", exten, context);
    let target = registry.request(tech, &data, transferer.native_formats())?;
    target.set_caller(transferer.caller());

    let answered = match target.call(&data, timeout) {
        Ok(()) => wait_for_answer(&target, timeout).await,
        Err(e) => Err(e),
    };
    if let Err(e) = answered {
        target.hangup().ok();
        return Err(e);
    }
    Ok(target)
}

/// Read from an outgoing `channel` until it is answered
///
/// Fails when it reports busy or congestion, hangs up, or `timeout` passes.
pub async fn wait_for_answer(channel: &Arc<Channel>, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while channel.state() != ChannelState::Up {
        let frame = match tokio::time::timeout_at(deadline, channel.read()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(SwitchError::ChannelGone(channel.name())),
            Err(_) => return Err(SwitchError::Timeout(format!("{} did not answer", channel.name()))),
        };
        if let Some(kind @ (ControlKind::Busy | ControlKind::Congestion)) = frame.control_kind() {
            return Err(SwitchError::feature(format!("{} reported {:?}", channel.name(), kind)));
        }
    }
    Ok(())
}

/// Leave `transferee` talking to `target` on behalf of `transferer`
///
/// The transferee's endpoint moves into a `Transferred/<name>` holding
/// channel, which is bridged to the target in a task of its own. Both are
/// hung up once that bridge ends. Returns the holding channel.
pub fn hand_over(transferee: &Arc<Channel>, target: &Arc<Channel>, transferer: &Arc<Channel>) -> Result<Arc<Channel>> {
    let registry = transferee
        .registry()
        .ok_or_else(|| SwitchError::feature(format!("{} has no registry", transferee.name())))?;
    if let Err(e) = transferee.indicate(ControlKind::Unhold) {
        debug!("Could not take {} off hold: {}", transferee.name(), e);
    }
    let holder = HoldingTech::new().adopt(&registry, HoldingTech::TRANSFERRED_PREFIX, transferee)?;
    holder.set_state(ChannelState::Up);
    holder.set_variable(ATTENDED_TRANSFER_VAR, transferer.name());
    info!(
        "Attended transfer of {} to {} by {}",
        holder.name(),
        target.name(),
        transferer.name()
    );

    let (chan, peer) = (holder.clone(), target.clone());
    tokio::spawn(async move {
        match bridge(&chan, &peer, &BridgeConfig::default()).await {
            Ok(outcome) => debug!("Transferred call {} ended: {:?}", chan.name(), outcome),
            Err(e) => warn!("Unable to bridge {} and {}: {}", chan.name(), peer.name(), e),
        }
        for channel in [&chan, &peer] {
            if let Err(e) = channel.hangup() {
                debug!("Hanging up {} failed: {}", channel.name(), e);
            }
        }
    });
    Ok(holder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelOptions;
    use crate::registry::ChannelRegistry;
    use crate::tech::mock::MockTech;
    use rvoip_media_core::Frame;

    #[tokio::test(start_paused = true)]
    async fn test_read_digits_stops_at_pound_and_timeout() {
        let registry = ChannelRegistry::new(ChannelOptions::default());
        let tech = Arc::new(MockTech::new("Mock"));
        let (chan, _) = tech.create(&registry, "Mock/a").unwrap();
        chan.set_end_dtmf_only(true);

        for c in ['1', '0', '#', '5'] {
            chan.queue_frame(Frame::dtmf_end(DtmfDigit::parse(c).unwrap(), 100));
        }
        let digits = read_digits(&chan, 10, Duration::from_secs(3)).await.unwrap();
        assert_eq!(digits, "10");

        let digits = read_digits(&chan, 10, Duration::from_secs(3)).await.unwrap();
        assert_eq!(digits, "5");
    }

    #[test]
    fn test_transfer_context_prefers_transferee() {
        let registry = ChannelRegistry::new(ChannelOptions::default());
        let tech = Arc::new(MockTech::new("Mock"));
        let (transferee, _) = tech.create(&registry, "Mock/a").unwrap();
        let (transferer, _) = tech.create(&registry, "Mock/b").unwrap();

        assert_eq!(transfer_context(&transferee, &transferer), "default");
        transferer.set_variable(TRANSFER_CONTEXT_VAR, "office");
        assert_eq!(transfer_context(&transferee, &transferer), "office");
        transferee.set_variable(TRANSFER_CONTEXT_VAR, "lobby");
        assert_eq!(transfer_context(&transferee, &transferer), "lobby");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_answer_fails_on_busy_and_timeout() {
        let registry = ChannelRegistry::new(ChannelOptions::default());
        let tech = Arc::new(MockTech::new("Mock"));
        let (chan, _) = tech.create(&registry, "Mock/out").unwrap();
        chan.call("100", Duration::from_secs(5)).unwrap();

        chan.queue_frame(Frame::control(ControlKind::Busy));
        assert!(matches!(
            wait_for_answer(&chan, Duration::from_secs(5)).await,
            Err(SwitchError::Feature(_))
        ));
        assert!(matches!(
            wait_for_answer(&chan, Duration::from_secs(5)).await,
            Err(SwitchError::Timeout(_))
        ));

        chan.queue_frame(Frame::control(ControlKind::Answer));
        wait_for_answer(&chan, Duration::from_secs(5)).await.unwrap();
        assert_eq!(chan.state(), ChannelState::Up);
    }

    #[test]
    fn test_blind_transfer_sets_location() {
        let registry = ChannelRegistry::new(ChannelOptions::default());
        let tech = Arc::new(MockTech::new("Mock"));
        let (transferee, _) = tech.create(&registry, "Mock/a").unwrap();
        let (transferer, _) = tech.create(&registry, "Mock/b").unwrap();

        blind_transfer(&transferee, &transferer, "2000").unwrap();
        let location = transferee.location();
        assert_eq!((location.context.as_str(), location.exten.as_str(), location.priority), ("default", "2000", 1));
        assert_eq!(transferee.variable(BLIND_TRANSFER_VAR).as_deref(), Some("Mock/b"));

        transferer.set_variable(TRANSFER_CONTEXT_VAR, "xfer");
        blind_transfer(&transferee, &transferer, "3000").unwrap();
        assert_eq!(transferee.location().context, "xfer");
        assert!(blind_transfer(&transferee, &transferer, "").is_err());
    }
}
