//! # Switch Core library for the RVOIP PBX
//!
//! `switch-core` is the channel switching core of the PBX. It models every
//! call leg as a [`Channel`] backed by a pluggable [`ChannelTech`], moves
//! media and signalling between channels, and implements the call
//! features built on top of that plumbing.
//!
//! This crate provides:
//!
//! - [`Channel`]s with a bounded frame queue, a read pipeline with DTMF
//!   emulation and a write pipeline with translation and generators
//! - A [`ChannelRegistry`] of live channels and channel drivers
//! - [`masquerade`], which moves one channel's call onto another channel
//! - The two-party [`bridge`] loop with in-call feature codes
//! - Call [`parking`], call [`pickup`] and blind [`transfer`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rvoip_switch_core::prelude::*;
//! use rvoip_switch_core::tech::mock::MockTech;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SwitchConfig::default();
//! let registry = ChannelRegistry::from_config(&config);
//! let tech = Arc::new(MockTech::new("Mock"));
//! let (alice, _) = tech.create(&registry, "Mock/alice")?;
//! let (bob, _) = tech.create(&registry, "Mock/bob")?;
//!
//! let features = Arc::new(FeatureMap::from_config(&config.features)?);
//! let outcome = bridge(&alice, &bob, &BridgeConfig::new(features)).await?;
//! println!("Bridge ended: {:?}", outcome);
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod channel;
pub mod config;
pub mod error;
pub mod generator;
pub mod logging;
pub mod masquerade;
pub mod parking;
pub mod pickup;
pub mod registry;
pub mod tech;
pub mod transfer;

pub use bridge::{bridge, BridgeConfig, BridgeOutcome, FeatureMap, FeaturePermissions, Side};
pub use channel::{Channel, ChannelOptions, ChannelSnapshot, ChannelState, SoftHangup};
pub use config::SwitchConfig;
pub use error::{Result, SwitchError};
pub use masquerade::masquerade;
pub use parking::ParkingLot;
pub use registry::ChannelRegistry;
pub use tech::{ChannelDriver, ChannelTech};

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::bridge::{
        bridge, BridgeConfig, BridgeOutcome, FeatureContext, FeatureMap, FeatureOperation, FeaturePermissions,
        FeatureResult, Side,
    };
    pub use crate::channel::{Channel, ChannelOptions, ChannelState, PartyId, SoftHangup};
    pub use crate::config::SwitchConfig;
    pub use crate::error::{Result, SwitchError};
    pub use crate::generator::{Generator, ToneGenerator};
    pub use crate::masquerade::masquerade;
    pub use crate::parking::ParkingLot;
    pub use crate::registry::ChannelRegistry;
    pub use crate::tech::{ChannelDriver, ChannelTech, TechCall};
    pub use rvoip_media_core::prelude::*;
}
