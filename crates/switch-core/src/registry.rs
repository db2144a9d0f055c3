//! Channel registry
//!
//! Every live channel is registered under its name and its unique id.
//! Lookups are lock free for readers; structural changes (allocation,
//! hang-up, masquerade) are serialized by the registry gate, which is always
//! taken before any channel lock.
//!
//! A channel lock is never taken while a map entry is borrowed: lookups
//! clone the `Arc`s out first and inspect the channels afterwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use rvoip_media_core::FormatSet;
use tracing::{debug, info};

use crate::channel::{Channel, ChannelBuilder, ChannelOptions, ChannelSnapshot};
use crate::config::SwitchConfig;
use crate::error::{Result, SwitchError};
use crate::tech::{ChannelDriver, ChannelTech};

static GLOBAL: Lazy<Arc<ChannelRegistry>> = Lazy::new(|| ChannelRegistry::new(ChannelOptions::default()));

/// Registry of live channels and channel drivers
pub struct ChannelRegistry {
    options: Arc<ChannelOptions>,
    by_name: DashMap<String, Arc<Channel>>,
    by_id: DashMap<String, Arc<Channel>>,
    drivers: DashMap<String, Arc<dyn ChannelDriver>>,
    gate: Mutex<()>,
    next_order: AtomicU64,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.by_name.len())
            .field("drivers", &self.drivers.len())
            .finish()
    }
}

impl ChannelRegistry {
    pub fn new(options: ChannelOptions) -> Arc<Self> {
        Arc::new(Self {
            options: Arc::new(options),
            by_name: DashMap::new(),
            by_id: DashMap::new(),
            drivers: DashMap::new(),
            gate: Mutex::new(()),
            next_order: AtomicU64::new(1),
        })
    }

    pub fn from_config(config: &SwitchConfig) -> Arc<Self> {
        Self::new(ChannelOptions::from(config))
    }

    /// Process-wide registry with default options
    pub fn global() -> Arc<Self> {
        GLOBAL.clone()
    }

    pub fn options(&self) -> &Arc<ChannelOptions> {
        &self.options
    }

    /// Start building a channel of `tech`. An empty name gets a generated one.
    pub fn channel(self: &Arc<Self>, tech: Arc<dyn ChannelTech>, name: impl Into<String>) -> ChannelBuilder {
        ChannelBuilder::new(self.clone(), tech, name.into())
    }

    pub(crate) fn next_order(&self) -> u64 {
        self.next_order.fetch_add(1, Ordering::Relaxed)
    }

    /// Serialize structural changes
    pub(crate) fn gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock()
    }

    pub(crate) fn register(&self, channel: &Arc<Channel>, name: &str, unique_id: &str) -> Result<()> {
        let _gate = self.gate();
        if self.by_name.contains_key(name) {
            return Err(SwitchError::DuplicateName(name.to_string()));
        }
        self.link(channel, name, unique_id);
        Ok(())
    }

    /// Add map entries. The gate must be held.
    pub(crate) fn link(&self, channel: &Arc<Channel>, name: &str, unique_id: &str) {
        self.by_name.insert(name.to_string(), channel.clone());
        self.by_id.insert(unique_id.to_string(), channel.clone());
    }

    /// Remove map entries that still point at `channel`. The gate must be held.
    pub(crate) fn unlink(&self, channel: &Arc<Channel>, name: &str, unique_id: &str) {
        self.by_name.remove_if(name, |_, c| Arc::ptr_eq(c, channel));
        self.by_id.remove_if(unique_id, |_, c| Arc::ptr_eq(c, channel));
    }

    /// Drop every entry pointing at `channel`
    pub(crate) fn unregister(&self, channel: &Arc<Channel>) {
        let _gate = self.gate();
        let (name, unique_id) = (channel.name(), channel.unique_id());
        self.unlink(channel, &name, &unique_id);
        debug!("Unregistered {} ({} channels left)", name, self.by_name.len());
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Channel>> {
        self.by_name.get(name).map(|entry| entry.value().clone())
    }

    pub fn find_by_unique_id(&self, unique_id: &str) -> Option<Arc<Channel>> {
        self.by_id.get(unique_id).map(|entry| entry.value().clone())
    }

    /// Every live channel, oldest first
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        let mut channels: Vec<Arc<Channel>> = self.by_name.iter().map(|e| e.value().clone()).collect();
        channels.sort_by_key(|c| c.order());
        channels
    }

    pub fn find_by_name_prefix(&self, prefix: &str) -> Vec<Arc<Channel>> {
        let mut channels: Vec<Arc<Channel>> = self
            .by_name
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.value().clone())
            .collect();
        channels.sort_by_key(|c| c.order());
        channels
    }

    pub fn by_technology(&self, type_name: &str) -> Vec<Arc<Channel>> {
        self.channels()
            .into_iter()
            .filter(|c| c.tech_type().eq_ignore_ascii_case(type_name))
            .collect()
    }

    pub fn by_extension(&self, context: &str, exten: &str) -> Vec<Arc<Channel>> {
        self.channels()
            .into_iter()
            .filter(|c| {
                let location = c.location();
                location.context == context && location.exten == exten
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn snapshots(&self) -> Vec<ChannelSnapshot> {
        self.channels().iter().map(|c| c.snapshot()).collect()
    }

    pub fn register_driver(&self, driver: Arc<dyn ChannelDriver>) {
        let type_name = driver.type_name().to_string();
        if self.drivers.insert(type_name.clone(), driver).is_some() {
            debug!("Replaced channel driver {}", type_name);
        } else {
            info!("🔌 Registered channel driver {}", type_name);
        }
    }

    pub fn unregister_driver(&self, type_name: &str) -> bool {
        self.drivers.remove(type_name).is_some()
    }

    /// Request an outgoing channel from the driver for `tech`
    pub fn request(self: &Arc<Self>, tech: &str, data: &str, formats: FormatSet) -> Result<Arc<Channel>> {
        let driver = self
            .drivers
            .get(tech)
            .map(|d| d.value().clone())
            .ok_or_else(|| SwitchError::unsupported(tech, "request"))?;
        let channel = driver.request(self, data, formats)?;
        debug!("Requested {}/{} -> {}", tech, data, channel.name());
        Ok(channel)
    }
}
