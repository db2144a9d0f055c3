//! Two-party bridge
//!
//! [`bridge`] relays frames between two channels until one of them hangs up,
//! a time limit runs out, or a feature code ends the call. Digits from a
//! side that may use features are collected instead of relayed until they
//! either match a code, can no longer match one, or the feature digit timer
//! runs out; digits that turn out not to be a feature are replayed to the
//! other side exactly as received.
//!
//! The loop is a small state machine: `Running` while neither side has
//! digits buffered, `FeaturePending` while one has, `Done` once an outcome
//! is known. All timers are recomputed from the clock on every pass.

use std::sync::Arc;
use std::time::Duration;

use rvoip_media_core::{ControlKind, DtmfDigit, Frame, FrameKind};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::error::{Result, SwitchError};

pub mod features;

pub use features::{
    validate_feature_codes, Feature, FeatureContext, FeatureMap, FeatureMatch, FeatureOperation,
    FeaturePermissions, FeatureResult,
};

/// Side of a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// The first channel passed to [`bridge`]
    Caller,
    /// The second channel passed to [`bridge`]
    Callee,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Caller => Side::Callee,
            Side::Callee => Side::Caller,
        }
    }

    fn index(self) -> usize {
        match self {
            Side::Caller => 0,
            Side::Callee => 1,
        }
    }
}

/// Bridge settings
#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    pub features: Arc<FeatureMap>,
    /// Features the caller may dial
    pub caller_features: FeaturePermissions,
    /// Features the callee may dial
    pub callee_features: FeaturePermissions,
    /// End the bridge after this long
    pub time_limit: Option<Duration>,
    /// Overrides the feature table's digit timeout
    pub feature_digit_timeout: Option<Duration>,
}

impl BridgeConfig {
    pub fn new(features: Arc<FeatureMap>) -> Self {
        Self {
            features,
            ..Default::default()
        }
    }

    pub fn permissions(&self, side: Side) -> &FeaturePermissions {
        match side {
            Side::Caller => &self.caller_features,
            Side::Callee => &self.callee_features,
        }
    }

    fn digit_timeout(&self) -> Duration {
        self.feature_digit_timeout
            .unwrap_or_else(|| self.features.digit_timeout())
    }
}

/// Why a bridge ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeOutcome {
    /// A side hung up
    Hangup { side: Side },
    Busy { side: Side },
    Congestion { side: Side },
    /// The configured time limit ran out
    TimeLimit,
    /// A feature ended the bridge
    FeatureTerminated { feature: String, side: Side },
    /// A feature sent `transferee` to `exten`
    Transfer { transferee: Side, exten: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BridgeState {
    Running,
    FeaturePending,
    Done(BridgeOutcome),
}

/// Digits a side dialled that may still become a feature code
#[derive(Debug, Default)]
struct PendingDigits {
    digits: Vec<(DtmfDigit, u32)>,
    deadline: Option<Instant>,
}

impl PendingDigits {
    fn code(&self) -> String {
        self.digits.iter().map(|(d, _)| d.as_char()).collect()
    }

    fn clear(&mut self) -> Vec<(DtmfDigit, u32)> {
        self.deadline = None;
        std::mem::take(&mut self.digits)
    }
}

enum Event {
    Frame(Side, Option<Frame>),
    Timer,
}

struct Bridge<'a> {
    channels: [&'a Arc<Channel>; 2],
    config: &'a BridgeConfig,
    state: BridgeState,
    pending: [PendingDigits; 2],
    /// Whether a side's digits go through the feature table
    collects: [bool; 2],
}

/// Bridge `caller` and `callee` until one of them leaves
///
/// Refused when the two are the same channel, when either is gone, or when
/// either is already bridged.
pub async fn bridge(caller: &Arc<Channel>, callee: &Arc<Channel>, config: &BridgeConfig) -> Result<BridgeOutcome> {
    if Arc::ptr_eq(caller, callee) {
        return Err(SwitchError::bridge("cannot bridge a channel to itself"));
    }
    for channel in [caller, callee] {
        if channel.check_hangup() {
            return Err(SwitchError::ChannelGone(channel.name()));
        }
        if let Some(peer) = channel.bridged_peer() {
            return Err(SwitchError::bridge(format!(
                "{} is already bridged to {}",
                channel.name(),
                peer.name()
            )));
        }
    }

    let mut bridge = Bridge {
        channels: [caller, callee],
        config,
        state: BridgeState::Running,
        pending: Default::default(),
        collects: [
            config.features.has_features_for(Side::Caller, &config.caller_features),
            config.features.has_features_for(Side::Callee, &config.callee_features),
        ],
    };

    bridge.setup();
    let outcome = bridge.run().await;
    bridge.teardown(&outcome);
    Ok(outcome)
}

impl<'a> Bridge<'a> {
    fn channel(&self, side: Side) -> &'a Arc<Channel> {
        self.channels[side.index()]
    }

    fn setup(&self) {
        let [caller, callee] = self.channels;
        caller.set_bridged(Some(callee));
        callee.set_bridged(Some(caller));
        for side in [Side::Caller, Side::Callee] {
            if self.collects[side.index()] {
                self.channel(side).set_end_dtmf_only(true);
            }
        }
        info!("🌉 Bridging {} and {}", caller.name(), callee.name());
    }

    fn teardown(&self, outcome: &BridgeOutcome) {
        let [caller, callee] = self.channels;
        for (channel, peer) in [(caller, callee), (callee, caller)] {
            if channel.bridged_peer().is_some_and(|p| Arc::ptr_eq(&p, peer)) {
                channel.set_bridged(None);
            }
        }
        for side in [Side::Caller, Side::Callee] {
            if self.collects[side.index()] {
                self.channel(side).set_end_dtmf_only(false);
            }
        }
        info!("🌉 Bridge of {} and {} ended: {:?}", caller.name(), callee.name(), outcome);
    }

    async fn run(&mut self) -> BridgeOutcome {
        let started = Instant::now();
        let [caller, callee] = self.channels;

        loop {
            if let BridgeState::Done(outcome) = &self.state {
                return outcome.clone();
            }

            let now = Instant::now();
            let time_left = match self.config.time_limit {
                Some(limit) => {
                    let left = limit.saturating_sub(now.saturating_duration_since(started));
                    if left.is_zero() {
                        debug!("Bridge time limit of {:?} reached", limit);
                        return BridgeOutcome::TimeLimit;
                    }
                    Some(left)
                }
                None => None,
            };

            for side in [Side::Caller, Side::Callee] {
                let expired = self.pending[side.index()]
                    .deadline
                    .is_some_and(|deadline| deadline <= now);
                if expired {
                    debug!("Feature digit timer expired for {:?}", side);
                    self.replay(side);
                }
            }
            self.update_state();

            let feature_left = self
                .pending
                .iter()
                .filter_map(|p| p.deadline)
                .min()
                .map(|deadline| deadline.saturating_duration_since(now));
            let sleep_for = match (time_left, feature_left) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            let event = tokio::select! {
                frame = caller.read() => Event::Frame(Side::Caller, frame),
                frame = callee.read() => Event::Frame(Side::Callee, frame),
                _ = sleep_or_forever(sleep_for) => Event::Timer,
            };

            match event {
                Event::Frame(side, None) => {
                    debug!("{} left the bridge", self.channel(side).name());
                    self.state = BridgeState::Done(BridgeOutcome::Hangup { side });
                }
                Event::Frame(side, Some(frame)) => self.on_frame(side, frame).await,
                Event::Timer => {}
            }
        }
    }

    fn update_state(&mut self) {
        if matches!(self.state, BridgeState::Done(_)) {
            return;
        }
        self.state = if self.pending.iter().any(|p| !p.digits.is_empty()) {
            BridgeState::FeaturePending
        } else {
            BridgeState::Running
        };
    }

    async fn on_frame(&mut self, side: Side, frame: Frame) {
        let other = self.channel(side.other());

        match frame.kind {
            FrameKind::Control(kind) => self.on_control(side, kind, &frame),
            FrameKind::Null => {}
            FrameKind::DtmfBegin(_) if self.collects[side.index()] => {}
            FrameKind::DtmfEnd(digit) if self.collects[side.index()] => {
                self.on_digit(side, digit, frame.duration_ms).await;
            }
            FrameKind::DtmfBegin(_)
            | FrameKind::DtmfEnd(_)
            | FrameKind::Voice(_)
            | FrameKind::Video(_)
            | FrameKind::Text => {
                if let Err(e) = other.write(frame) {
                    debug!("Relay to {} failed: {}", other.name(), e);
                }
            }
        }
    }

    fn on_control(&mut self, side: Side, kind: ControlKind, frame: &Frame) {
        let other = self.channel(side.other());
        match kind {
            ControlKind::Busy => self.state = BridgeState::Done(BridgeOutcome::Busy { side }),
            ControlKind::Congestion => self.state = BridgeState::Done(BridgeOutcome::Congestion { side }),
            ControlKind::Hangup => self.state = BridgeState::Done(BridgeOutcome::Hangup { side }),
            ControlKind::Answer | ControlKind::EndOfQueue => {}
            _ => {
                if let Err(e) = other.indicate_data(kind, &frame.data) {
                    debug!("{} could not take {:?}: {}", other.name(), kind, e);
                }
            }
        }
    }

    async fn on_digit(&mut self, side: Side, digit: DtmfDigit, duration_ms: u32) {
        let features = self.config.features.clone();
        let permissions = *self.config.permissions(side);
        let pending = &mut self.pending[side.index()];
        pending.digits.push((digit, duration_ms));
        let code = pending.code();

        match features.lookup(&code, side, &permissions) {
            FeatureMatch::None => {
                debug!("{} is no feature code for {:?}, relaying", code, side);
                self.replay(side);
            }
            FeatureMatch::Prefix => {
                pending.deadline = Some(Instant::now() + self.config.digit_timeout());
                debug!("{} may become a feature code for {:?}", code, side);
            }
            FeatureMatch::Exact(feature) => {
                pending.clear();
                let activator = self.channel(side);
                let peer = self.channel(side.other());
                match features.run(feature, side, activator, peer).await {
                    Ok(FeatureResult::Continue) => {}
                    Ok(FeatureResult::Terminate) => {
                        self.state = BridgeState::Done(BridgeOutcome::FeatureTerminated {
                            feature: feature.name.clone(),
                            side,
                        });
                    }
                    Ok(FeatureResult::Transfer { transferee, exten }) => {
                        self.state = BridgeState::Done(BridgeOutcome::Transfer { transferee, exten });
                    }
                    Err(e) => warn!("Feature {} failed for {}: {}", feature.name, activator.name(), e),
                }
            }
        }
        self.update_state();
    }

    /// Send buffered digits on to the other side as they were received
    fn replay(&mut self, side: Side) {
        let digits = self.pending[side.index()].clear();
        let other = self.channel(side.other());
        for (digit, duration_ms) in digits {
            let result = other
                .write(Frame::dtmf_begin(digit))
                .and_then(|_| other.write(Frame::dtmf_end(digit, duration_ms)));
            if let Err(e) = result {
                debug!("Replaying {} to {} failed: {}", digit, other.name(), e);
                break;
            }
        }
    }
}

async fn sleep_or_forever(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}
