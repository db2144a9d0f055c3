//! In-call feature codes
//!
//! A [`FeatureMap`] binds DTMF sequences to [`FeatureOperation`]s. The
//! built-in features (disconnect, blind and attended transfer, park,
//! pickup) come from
//! the `[features]` configuration section; dynamic features are declared
//! in configuration and bound to an operation in code with
//! [`FeatureMap::bind`].
//!
//! A table in which one code is a strict prefix of another is rejected
//! when it is built, so a digit sequence can never be both an exact match
//! and the start of a longer code.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rvoip_media_core::{ControlKind, DtmfDigit};
use tracing::{debug, info, warn};

use super::{BridgeConfig, Side};
use crate::channel::{Channel, ChannelState, SoftHangup};
use crate::config::{ActivateOn, ActivatedBy, FeaturesConfig};
use crate::error::{Result, SwitchError};
use crate::parking::ParkingLot;
use crate::pickup;
use crate::transfer;

/// Check a list of (name, code) pairs for codes that cannot work together
pub fn validate_feature_codes(codes: &[(&str, &str)]) -> std::result::Result<(), String> {
    for (name, code) in codes {
        if code.is_empty() {
            return Err(format!("feature {} has an empty code", name));
        }
        if let Some(c) = code.chars().find(|c| DtmfDigit::from_char(*c).is_none()) {
            return Err(format!("feature {} code {:?} contains {:?}, not a DTMF digit", name, code, c));
        }
    }

    for (i, (name, code)) in codes.iter().enumerate() {
        for (other_name, other) in &codes[i + 1..] {
            if code == other {
                return Err(format!("features {} and {} share the code {:?}", name, other_name, code));
            }
            if other.starts_with(code) || code.starts_with(other) {
                let (short, long) = if code.len() < other.len() {
                    (name, other_name)
                } else {
                    (other_name, name)
                };
                return Err(format!("feature {} code is a prefix of feature {} code", short, long));
            }
        }
    }
    Ok(())
}

/// Which features each side of a bridge may use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeaturePermissions {
    pub disconnect: bool,
    pub blindxfer: bool,
    pub parkcall: bool,
    pub pickup: bool,
    pub atxfer: bool,
    /// Dynamic features scoped to this side
    pub dynamic: bool,
}

impl FeaturePermissions {
    pub fn all() -> Self {
        Self {
            disconnect: true,
            blindxfer: true,
            parkcall: true,
            pickup: true,
            atxfer: true,
            dynamic: true,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn any(&self) -> bool {
        self.disconnect || self.blindxfer || self.parkcall || self.pickup || self.atxfer || self.dynamic
    }

    fn allows(&self, builtin: Option<Builtin>) -> bool {
        match builtin {
            Some(Builtin::Disconnect) => self.disconnect,
            Some(Builtin::BlindTransfer) => self.blindxfer,
            Some(Builtin::ParkCall) => self.parkcall,
            Some(Builtin::Pickup) => self.pickup,
            Some(Builtin::AttendedTransfer) => self.atxfer,
            None => self.dynamic,
        }
    }
}

/// What the bridge does after a feature ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureResult {
    /// Keep bridging
    Continue,
    /// End the bridge
    Terminate,
    /// End the bridge; the given side continues at `exten`
    Transfer { transferee: Side, exten: String },
}

/// Everything a feature operation may act on
pub struct FeatureContext {
    /// Name of the feature that matched
    pub feature: String,
    /// The digits that matched
    pub code: String,
    /// Which side dialled the code
    pub side: Side,
    pub activator: Arc<Channel>,
    pub peer: Arc<Channel>,
    /// The channel the feature is meant to act on
    pub target: Arc<Channel>,
    /// How long to wait for further digits the feature collects
    pub digit_timeout: Duration,
}

impl fmt::Debug for FeatureContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureContext")
            .field("feature", &self.feature)
            .field("code", &self.code)
            .field("side", &self.side)
            .field("activator", &self.activator.name())
            .field("target", &self.target.name())
            .finish()
    }
}

/// An action bound to a feature code
#[async_trait]
pub trait FeatureOperation: Send + Sync {
    async fn execute(&self, ctx: &FeatureContext) -> Result<FeatureResult>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    Disconnect,
    BlindTransfer,
    ParkCall,
    Pickup,
    AttendedTransfer,
}

/// One entry of the feature table
#[derive(Clone)]
pub struct Feature {
    pub name: String,
    pub code: String,
    pub activated_by: ActivatedBy,
    pub activate_on: ActivateOn,
    builtin: Option<Builtin>,
    operation: Option<Arc<dyn FeatureOperation>>,
}

impl Feature {
    fn usable_by(&self, side: Side, permissions: &FeaturePermissions) -> bool {
        let by = match self.activated_by {
            ActivatedBy::Both => true,
            ActivatedBy::Caller => side == Side::Caller,
            ActivatedBy::Callee => side == Side::Callee,
        };
        by && permissions.allows(self.builtin)
    }

    pub fn is_builtin(&self) -> bool {
        self.builtin.is_some()
    }

    pub fn is_bound(&self) -> bool {
        self.operation.is_some()
    }
}

impl fmt::Debug for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feature")
            .field("name", &self.name)
            .field("code", &self.code)
            .field("activated_by", &self.activated_by)
            .field("activate_on", &self.activate_on)
            .field("bound", &self.operation.is_some())
            .finish()
    }
}

/// Result of matching buffered digits against the table
#[derive(Debug)]
pub enum FeatureMatch<'a> {
    /// No code starts with these digits
    None,
    /// Some code starts with these digits
    Prefix,
    Exact(&'a Feature),
}

/// The feature code table
#[derive(Debug, Clone, Default)]
pub struct FeatureMap {
    features: Vec<Feature>,
    digit_timeout: Duration,
    transfer_timeout: Duration,
}

impl FeatureMap {
    /// Build the table from configuration. Dynamic features start unbound.
    pub fn from_config(config: &FeaturesConfig) -> Result<Self> {
        validate_feature_codes(&config.codes()).map_err(SwitchError::config)?;

        let builtins = [
            ("disconnect", &config.disconnect, Builtin::Disconnect, ActivateOn::SelfParty),
            ("blindxfer", &config.blindxfer, Builtin::BlindTransfer, ActivateOn::Peer),
            ("parkcall", &config.parkcall, Builtin::ParkCall, ActivateOn::Peer),
            ("pickup", &config.pickup, Builtin::Pickup, ActivateOn::SelfParty),
            ("atxfer", &config.atxfer, Builtin::AttendedTransfer, ActivateOn::Peer),
        ];
        let transfer_timeout = config.transfer_digit_timeout();
        let atxfer: Option<Arc<dyn FeatureOperation>> = if config.atxfer.is_empty() {
            None
        } else {
            Some(Arc::new(AttendedTransfer {
                tech: config.atxfer_tech.clone(),
                dial_timeout: config.atxfer_dial_timeout(),
                consult: Arc::new(consult_features(config)?),
            }))
        };

        let mut features: Vec<Feature> = builtins
            .into_iter()
            .filter(|(_, code, _, _)| !code.is_empty())
            .map(|(name, code, builtin, activate_on)| {
                let operation: Option<Arc<dyn FeatureOperation>> = match builtin {
                    Builtin::Disconnect => Some(Arc::new(Disconnect)),
                    Builtin::BlindTransfer => Some(Arc::new(BlindTransfer)),
                    Builtin::Pickup => Some(Arc::new(Pickup)),
                    Builtin::AttendedTransfer => atxfer.clone(),
                    // needs a parking lot, see with_parking
                    Builtin::ParkCall => None,
                };
                Feature {
                    name: name.to_string(),
                    code: code.clone(),
                    activated_by: ActivatedBy::Both,
                    activate_on,
                    builtin: Some(builtin),
                    operation,
                }
            })
            .collect();

        features.extend(config.dynamic.iter().map(|d| Feature {
            name: d.name.clone(),
            code: d.code.clone(),
            activated_by: d.activated_by,
            activate_on: d.activate_on,
            builtin: None,
            operation: None,
        }));

        debug!("Feature table has {} codes", features.len());
        Ok(Self {
            features,
            digit_timeout: config.feature_digit_timeout(),
            transfer_timeout,
        })
    }

    /// Let `parkcall` park into `lot`
    pub fn with_parking(mut self, lot: Arc<ParkingLot>) -> Self {
        for feature in self.features.iter_mut().filter(|f| f.builtin == Some(Builtin::ParkCall)) {
            feature.operation = Some(Arc::new(ParkCall { lot: lot.clone() }));
        }
        self
    }

    /// Bind the operation of a configured dynamic feature. Returns false if
    /// no dynamic feature has that name.
    pub fn bind(&mut self, name: &str, operation: Arc<dyn FeatureOperation>) -> bool {
        match self.features.iter_mut().find(|f| f.builtin.is_none() && f.name == name) {
            Some(feature) => {
                feature.operation = Some(operation);
                info!("Bound feature {} to code {}", name, feature.code);
                true
            }
            None => {
                warn!("No dynamic feature named {} is configured", name);
                false
            }
        }
    }

    /// Add a dynamic feature that is not in configuration
    pub fn register(
        &mut self,
        name: impl Into<String>,
        code: impl Into<String>,
        activated_by: ActivatedBy,
        activate_on: ActivateOn,
        operation: Arc<dyn FeatureOperation>,
    ) -> Result<()> {
        let (name, code) = (name.into(), code.into());
        let mut codes: Vec<(&str, &str)> = self
            .features
            .iter()
            .map(|f| (f.name.as_str(), f.code.as_str()))
            .collect();
        codes.push((&name, &code));
        validate_feature_codes(&codes).map_err(SwitchError::config)?;

        self.features.push(Feature {
            name,
            code,
            activated_by,
            activate_on,
            builtin: None,
            operation: Some(operation),
        });
        Ok(())
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn get(&self, name: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.name == name)
    }

    /// Time allowed between the digits of a code
    pub fn digit_timeout(&self) -> Duration {
        self.digit_timeout
    }

    pub fn set_digit_timeout(&mut self, timeout: Duration) {
        self.digit_timeout = timeout;
    }

    pub fn transfer_timeout(&self) -> Duration {
        self.transfer_timeout
    }

    /// Longest code `side` could dial
    pub fn longest_code(&self, side: Side, permissions: &FeaturePermissions) -> usize {
        self.features
            .iter()
            .filter(|f| f.usable_by(side, permissions))
            .map(|f| f.code.len())
            .max()
            .unwrap_or(0)
    }

    /// Whether `side` has any feature it could dial
    pub fn has_features_for(&self, side: Side, permissions: &FeaturePermissions) -> bool {
        self.longest_code(side, permissions) > 0
    }

    /// Match buffered digits dialled by `side`
    pub fn lookup(&self, digits: &str, side: Side, permissions: &FeaturePermissions) -> FeatureMatch<'_> {
        let mut prefix = false;
        for feature in self.features.iter().filter(|f| f.usable_by(side, permissions)) {
            if feature.code == digits {
                return FeatureMatch::Exact(feature);
            }
            if feature.code.starts_with(digits) {
                prefix = true;
            }
        }
        if prefix {
            FeatureMatch::Prefix
        } else {
            FeatureMatch::None
        }
    }

    /// Run `feature` for `side`
    pub(crate) async fn run(
        &self,
        feature: &Feature,
        side: Side,
        activator: &Arc<Channel>,
        peer: &Arc<Channel>,
    ) -> Result<FeatureResult> {
        let Some(operation) = &feature.operation else {
            warn!("Feature {} matched but has no operation bound", feature.name);
            return Err(SwitchError::feature(format!("{} is not bound", feature.name)));
        };
        if peer.is_zombie() || peer.check_hangup() {
            return Err(SwitchError::feature(format!("{} has no peer to act on", feature.name)));
        }

        let target = match feature.activate_on {
            ActivateOn::SelfParty => activator.clone(),
            ActivateOn::Peer => peer.clone(),
        };
        let digit_timeout = match feature.builtin {
            Some(Builtin::BlindTransfer | Builtin::AttendedTransfer) => self.transfer_timeout,
            _ => self.digit_timeout,
        };
        let ctx = FeatureContext {
            feature: feature.name.clone(),
            code: feature.code.clone(),
            side,
            activator: activator.clone(),
            peer: peer.clone(),
            target,
            digit_timeout,
        };
        info!("Feature {} ({}) activated by {}", feature.name, feature.code, activator.name());
        operation.execute(&ctx).await
    }
}

/// Hang up the activator
struct Disconnect;

#[async_trait]
impl FeatureOperation for Disconnect {
    async fn execute(&self, ctx: &FeatureContext) -> Result<FeatureResult> {
        ctx.target.softhangup(SoftHangup::EXPLICIT);
        Ok(FeatureResult::Terminate)
    }
}

/// Collect an extension from the activator and send the peer there
struct BlindTransfer;

#[async_trait]
impl FeatureOperation for BlindTransfer {
    async fn execute(&self, ctx: &FeatureContext) -> Result<FeatureResult> {
        ctx.peer.indicate(ControlKind::Hold).ok();
        let exten = transfer::read_digits(&ctx.activator, 32, ctx.digit_timeout).await?;
        if exten.is_empty() {
            ctx.peer.indicate(ControlKind::Unhold).ok();
            debug!("Blind transfer by {} abandoned", ctx.activator.name());
            return Ok(FeatureResult::Continue);
        }
        transfer::blind_transfer(&ctx.target, &ctx.activator, &exten)?;
        Ok(FeatureResult::Transfer {
            transferee: ctx.side.other(),
            exten,
        })
    }
}

/// Park the peer and tell the activator where
struct ParkCall {
    lot: Arc<ParkingLot>,
}

#[async_trait]
impl FeatureOperation for ParkCall {
    async fn execute(&self, ctx: &FeatureContext) -> Result<FeatureResult> {
        self.lot.park(&ctx.target, Some(&ctx.activator), None)?;
        Ok(FeatureResult::Terminate)
    }
}

/// Pick up a ringing call for the activator
struct Pickup;

#[async_trait]
impl FeatureOperation for Pickup {
    async fn execute(&self, ctx: &FeatureContext) -> Result<FeatureResult> {
        pickup::pickup(&ctx.target)?;
        Ok(FeatureResult::Terminate)
    }
}

/// The table offered while an attended transfer consults its target:
/// only disconnect, which hands the transferee over
fn consult_features(config: &FeaturesConfig) -> Result<FeatureMap> {
    FeatureMap::from_config(&FeaturesConfig {
        disconnect: config.disconnect.clone(),
        blindxfer: String::new(),
        parkcall: String::new(),
        pickup: String::new(),
        atxfer: String::new(),
        dynamic: Vec::new(),
        ..config.clone()
    })
}

/// Collect an extension, talk to it, then leave the peer with it
///
/// The peer waits on hold while the activator dials the target and
/// consults with it in a bridge of their own. When the activator leaves
/// that bridge (hang-up or disconnect code) with the target still up, the
/// peer is handed to the target. If the target never answers or leaves
/// first, the peer comes off hold and the original bridge carries on.
struct AttendedTransfer {
    tech: String,
    dial_timeout: Duration,
    consult: Arc<FeatureMap>,
}

impl AttendedTransfer {
    fn abandon(&self, ctx: &FeatureContext, why: &str) -> FeatureResult {
        ctx.peer.indicate(ControlKind::Unhold).ok();
        info!("Attended transfer by {} abandoned: {}", ctx.activator.name(), why);
        FeatureResult::Continue
    }
}

#[async_trait]
impl FeatureOperation for AttendedTransfer {
    async fn execute(&self, ctx: &FeatureContext) -> Result<FeatureResult> {
        let (transferer, transferee) = (&ctx.activator, &ctx.target);
        transferee.indicate(ControlKind::Hold).ok();
        let exten = transfer::read_digits(transferer, 32, ctx.digit_timeout).await?;
        if exten.is_empty() {
            return Ok(self.abandon(ctx, "no extension dialled"));
        }

        let context = transfer::transfer_context(transferee, transferer);
        let target = match transfer::dial_target(transferer, &self.tech, &exten, &context, self.dial_timeout).await {
            Ok(target) => target,
            Err(e) => {
                warn!("Unable to reach {}@{} for {}: {}", exten, context, transferer.name(), e);
                return Ok(self.abandon(ctx, "target unreachable"));
            }
        };

        let disconnect_only = FeaturePermissions {
            disconnect: true,
            ..FeaturePermissions::none()
        };
        let config = BridgeConfig {
            caller_features: disconnect_only,
            callee_features: disconnect_only,
            ..BridgeConfig::new(self.consult.clone())
        };
        transferer.set_bridged(None);
        match super::bridge(transferer, &target, &config).await {
            Ok(outcome) => debug!("Consultation of {} with {} ended: {:?}", transferer.name(), target.name(), outcome),
            Err(e) => debug!("Consultation of {} with {} failed: {}", transferer.name(), target.name(), e),
        }

        let target_up = !target.check_hangup() && target.state() == ChannelState::Up;
        if !target_up || !transferer.check_hangup() {
            if let Err(e) = target.hangup() {
                debug!("Hanging up {} failed: {}", target.name(), e);
            }
            if !transferer.check_hangup() {
                transferer.set_bridged(Some(transferee));
                transferer.set_end_dtmf_only(true);
            }
            return Ok(self.abandon(ctx, "target left the consultation"));
        }

        if let Err(e) = transfer::hand_over(transferee, &target, transferer) {
            target.hangup().ok();
            return Err(e);
        }
        Ok(FeatureResult::Terminate)
    }
}

/// Operations keyed by dynamic feature name, for binding in bulk
pub type FeatureOperations = HashMap<String, Arc<dyn FeatureOperation>>;

impl FeatureMap {
    /// Bind every operation in `operations`; returns the names left unbound
    pub fn bind_all(&mut self, operations: &FeatureOperations) -> Vec<String> {
        for (name, operation) in operations {
            self.bind(name, operation.clone());
        }
        self.features
            .iter()
            .filter(|f| f.operation.is_none())
            .map(|f| f.name.clone())
            .collect()
    }
}
