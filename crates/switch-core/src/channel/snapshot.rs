//! Point-in-time view of a channel for listings and logs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Channel, ChannelState, PartyId};

/// Serializable copy of a channel's visible state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub name: String,
    pub unique_id: String,
    pub tech: String,
    pub state: ChannelState,
    pub native_formats: String,
    pub read_format: String,
    pub write_format: String,
    pub queued_frames: usize,
    pub bridged_to: Option<String>,
    pub caller: PartyId,
    pub connected: PartyId,
    pub context: String,
    pub exten: String,
    pub priority: u32,
    pub softhangup: u32,
    pub hangup_cause: u32,
    pub zombie: bool,
    pub generator: Option<String>,
    pub frames_in: u64,
    pub frames_out: u64,
    pub dropped_frames: u64,
    pub created: DateTime<Utc>,
}

impl Channel {
    pub fn snapshot(&self) -> ChannelSnapshot {
        let bridged_to = self.bridged_peer().map(|peer| peer.name());
        let inner = self.inner.lock();
        ChannelSnapshot {
            name: inner.name.clone(),
            unique_id: inner.unique_id.clone(),
            tech: inner.tech.type_name().to_string(),
            state: inner.state,
            native_formats: inner.native_formats.to_string(),
            read_format: inner.read_format.to_string(),
            write_format: inner.write_format.to_string(),
            queued_frames: inner.readq.len(),
            bridged_to,
            caller: inner.caller.clone(),
            connected: inner.connected.clone(),
            context: inner.location.context.clone(),
            exten: inner.location.exten.clone(),
            priority: inner.location.priority,
            softhangup: inner.softhangup.bits(),
            hangup_cause: inner.hangup_cause,
            zombie: inner.flags.zombie,
            generator: inner.generator.as_ref().map(|g| g.name.to_string()),
            frames_in: inner.stats.frames_in,
            frames_out: inner.stats.frames_out,
            dropped_frames: inner.stats.dropped_frames,
            created: self.created(),
        }
    }
}
