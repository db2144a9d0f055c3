//! Call parking
//!
//! Parking masquerades a call into a `Parked/<name>` holding channel that
//! nobody services. The endpoint keeps hearing hold while the slot is
//! occupied, and [`ParkingLot::unpark`] hands the holding channel (which
//! by then carries the endpoint) to whoever retrieves the call.
//!
//! Expiry is not acted on here; each parked call records its deadline and
//! [`ParkingLot::expired`] lists the slots past it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rvoip_media_core::ControlKind;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::{Channel, DialplanLocation};
use crate::config::ParkingConfig;
use crate::error::{Result, SwitchError};
use crate::registry::ChannelRegistry;
use crate::tech::holding::HoldingTech;

/// Variable set on the parked call and on whoever parked it
pub const PARKING_SLOT_VAR: &str = "PARKINGSLOT";

/// A call sitting in a parking slot
#[derive(Debug, Clone)]
pub struct ParkedCall {
    pub slot: u32,
    /// The holding channel, now carrying the parked endpoint
    pub channel: Arc<Channel>,
    /// Name of the channel that parked the call
    pub parker: Option<String>,
    /// Where the call was before it was parked
    pub return_to: DialplanLocation,
    pub parked_at: DateTime<Utc>,
    pub deadline: Instant,
}

/// Listing entry for a parked call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParkedCallInfo {
    pub slot: u32,
    pub channel: String,
    pub parker: Option<String>,
    pub parked_at: DateTime<Utc>,
    pub remaining_ms: u64,
}

#[derive(Debug, Default)]
struct Slots {
    parked: BTreeMap<u32, ParkedCall>,
    /// Slots handed out to a park that has not finished
    reserved: BTreeSet<u32>,
}

/// A range of parking slots
pub struct ParkingLot {
    name: String,
    first_slot: u32,
    last_slot: u32,
    park_time: Duration,
    registry: Arc<ChannelRegistry>,
    holding: Arc<HoldingTech>,
    slots: Mutex<Slots>,
}

impl std::fmt::Debug for ParkingLot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParkingLot")
            .field("name", &self.name)
            .field("slots", &format!("{}-{}", self.first_slot, self.last_slot))
            .field("parked", &self.slots.lock().parked.len())
            .finish()
    }
}

impl ParkingLot {
    pub fn new(registry: Arc<ChannelRegistry>, config: &ParkingConfig) -> Arc<Self> {
        info!(
            "🅿️ Parking lot {} with slots {}-{}",
            config.name, config.first_slot, config.last_slot
        );
        Arc::new(Self {
            name: config.name.clone(),
            first_slot: config.first_slot,
            last_slot: config.last_slot,
            park_time: Duration::from_millis(config.park_time_ms),
            registry,
            holding: HoldingTech::new(),
            slots: Mutex::new(Slots::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn reserve(&self) -> Result<u32> {
        let mut slots = self.slots.lock();
        let free = (self.first_slot..=self.last_slot)
            .find(|slot| !slots.parked.contains_key(slot) && !slots.reserved.contains(slot));
        match free {
            Some(slot) => {
                slots.reserved.insert(slot);
                Ok(slot)
            }
            None => {
                warn!("No more parking spaces in lot {}", self.name);
                Err(SwitchError::parking(format!("lot {} is full", self.name)))
            }
        }
    }

    fn release_reservation(&self, slot: u32) {
        self.slots.lock().reserved.remove(&slot);
    }

    /// Park `channel` in the lowest free slot
    ///
    /// `announce_to` is told the slot number. `timeout` overrides the lot's
    /// parking time. Returns the slot.
    pub fn park(
        &self,
        channel: &Arc<Channel>,
        announce_to: Option<&Arc<Channel>>,
        timeout: Option<Duration>,
    ) -> Result<u32> {
        if channel.check_hangup() {
            return Err(SwitchError::ChannelGone(channel.name()));
        }
        let slot = self.reserve()?;

        let holder = match self.holding.adopt(&self.registry, HoldingTech::PARKED_PREFIX, channel) {
            Ok(holder) => holder,
            Err(e) => {
                warn!("Unable to park {}: {}", channel.name(), e);
                self.release_reservation(slot);
                return Err(e);
            }
        };

        let return_to = holder.location();
        holder.set_variable(PARKING_SLOT_VAR, slot.to_string());
        if let Err(e) = holder.indicate(ControlKind::Hold) {
            debug!("Could not put parked call {} on hold: {}", holder.name(), e);
        }

        let parker = announce_to.map(|peer| {
            peer.set_variable(PARKING_SLOT_VAR, slot.to_string());
            if let Err(e) = peer.send_text(&format!("Parked at {}", slot)) {
                debug!("Could not announce slot {} to {}: {}", slot, peer.name(), e);
            }
            peer.name()
        });

        let park_time = timeout.filter(|t| !t.is_zero()).unwrap_or(self.park_time);
        let parked = ParkedCall {
            slot,
            channel: holder.clone(),
            parker,
            return_to,
            parked_at: Utc::now(),
            deadline: Instant::now() + park_time,
        };
        {
            let mut slots = self.slots.lock();
            slots.reserved.remove(&slot);
            slots.parked.insert(slot, parked);
        }

        info!(
            "🅿️ Parked {} on {}@{}, times out in {} s",
            holder.name(),
            slot,
            self.name,
            park_time.as_secs()
        );
        Ok(slot)
    }

    /// Take the call out of `slot`
    pub fn unpark(&self, slot: u32) -> Result<Arc<Channel>> {
        let parked = self
            .slots
            .lock()
            .parked
            .remove(&slot)
            .ok_or_else(|| SwitchError::parking(format!("nothing parked on {}@{}", slot, self.name)))?;

        let channel = parked.channel;
        if let Err(e) = channel.indicate(ControlKind::Unhold) {
            debug!("Could not take {} off hold: {}", channel.name(), e);
        }
        info!("🅿️ Retrieved {} from {}@{}", channel.name(), slot, self.name);
        Ok(channel)
    }

    pub fn get(&self, slot: u32) -> Option<ParkedCall> {
        self.slots.lock().parked.get(&slot).cloned()
    }

    /// Slot of the parked call whose holder is `channel`
    pub fn slot_of(&self, channel: &Arc<Channel>) -> Option<u32> {
        self.slots
            .lock()
            .parked
            .values()
            .find(|p| Arc::ptr_eq(&p.channel, channel))
            .map(|p| p.slot)
    }

    /// Slots whose parking time has run out
    pub fn expired(&self) -> Vec<u32> {
        let now = Instant::now();
        self.slots
            .lock()
            .parked
            .values()
            .filter(|p| p.deadline <= now)
            .map(|p| p.slot)
            .collect()
    }

    /// Drop slots whose holder has hung up. Returns how many were removed.
    pub fn prune_hung_up(&self) -> usize {
        let calls: Vec<ParkedCall> = self.slots.lock().parked.values().cloned().collect();
        let gone: Vec<u32> = calls
            .iter()
            .filter(|p| p.channel.check_hangup())
            .map(|p| p.slot)
            .collect();
        let mut slots = self.slots.lock();
        for slot in &gone {
            slots.parked.remove(slot);
        }
        gone.len()
    }

    pub fn parked_calls(&self) -> Vec<ParkedCallInfo> {
        let now = Instant::now();
        let calls: Vec<ParkedCall> = self.slots.lock().parked.values().cloned().collect();
        calls
            .into_iter()
            .map(|p| ParkedCallInfo {
                slot: p.slot,
                channel: p.channel.name(),
                parker: p.parker,
                parked_at: p.parked_at,
                remaining_ms: p.deadline.saturating_duration_since(now).as_millis() as u64,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelOptions;
    use crate::tech::mock::MockTech;

    fn lot(first: u32, last: u32) -> (Arc<ChannelRegistry>, Arc<ParkingLot>) {
        let registry = ChannelRegistry::new(ChannelOptions::default());
        let config = ParkingConfig {
            first_slot: first,
            last_slot: last,
            ..Default::default()
        };
        let lot = ParkingLot::new(registry.clone(), &config);
        (registry, lot)
    }

    #[tokio::test]
    async fn test_park_and_unpark() {
        println!("🧪 Testing park and unpark");
        let (registry, lot) = lot(701, 702);
        let tech = Arc::new(MockTech::new("Mock"));
        let (call, call_ep) = tech.create(&registry, "Mock/alice").unwrap();
        let (parker, parker_ep) = tech.create(&registry, "Mock/bob").unwrap();

        let slot = lot.park(&call, Some(&parker), None).unwrap();
        assert_eq!(slot, 701);
        assert!(call.is_zombie());
        assert_eq!(parker.variable(PARKING_SLOT_VAR).as_deref(), Some("701"));
        assert_eq!(parker_ep.log().texts, vec!["Parked at 701".to_string()]);

        let holder = registry.find_by_name("Mock/alice").unwrap();
        assert!(!Arc::ptr_eq(&holder, &call));
        assert!(call_ep.indications().contains(&ControlKind::Hold));
        assert_eq!(lot.slot_of(&holder), Some(701));

        let retrieved = lot.unpark(701).unwrap();
        assert!(Arc::ptr_eq(&retrieved, &holder));
        assert!(call_ep.indications().contains(&ControlKind::Unhold));
        assert!(lot.is_empty());
        assert!(lot.unpark(701).is_err());
    }

    #[tokio::test]
    async fn test_lowest_free_slot_and_full_lot() {
        let (registry, lot) = lot(10, 11);
        let tech = Arc::new(MockTech::new("Mock"));
        let (a, _) = tech.create(&registry, "Mock/a").unwrap();
        let (b, _) = tech.create(&registry, "Mock/b").unwrap();
        let (c, _) = tech.create(&registry, "Mock/c").unwrap();

        assert_eq!(lot.park(&a, None, None).unwrap(), 10);
        assert_eq!(lot.park(&b, None, Some(Duration::from_secs(5))).unwrap(), 11);
        assert!(matches!(lot.park(&c, None, None), Err(SwitchError::Parking(_))));
        assert!(!c.is_zombie());

        lot.unpark(10).unwrap();
        assert_eq!(lot.park(&c, None, None).unwrap(), 10);
        assert_eq!(lot.parked_calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_is_reported() {
        let (registry, lot) = lot(1, 5);
        let tech = Arc::new(MockTech::new("Mock"));
        let (a, _) = tech.create(&registry, "Mock/a").unwrap();
        lot.park(&a, None, Some(Duration::from_secs(2))).unwrap();

        assert!(lot.expired().is_empty());
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(lot.expired(), vec![1]);
    }
}
