//! Holding technology
//!
//! A holding channel is an internal placeholder a call is masqueraded into
//! while no application services it, such as a parked call, or while an
//! attended transfer hands it to a new peer. It accepts and discards media
//! and remembers the last indication it was given.

use std::sync::Arc;

use parking_lot::Mutex;
use rvoip_media_core::{ControlKind, Format, FormatSet, Frame};
use tracing::debug;

use super::{ChannelTech, TechCall};
use crate::channel::Channel;
use crate::error::Result;
use crate::masquerade;
use crate::registry::ChannelRegistry;

/// Internal placeholder technology
#[derive(Debug, Default)]
pub struct HoldingTech {
    last_indication: Mutex<Option<ControlKind>>,
}

impl HoldingTech {
    pub const TYPE_NAME: &'static str = "Holding";
    /// Name prefix of channels holding a parked call
    pub const PARKED_PREFIX: &'static str = "Parked";
    /// Name prefix of channels carrying an attended transfer's transferee
    pub const TRANSFERRED_PREFIX: &'static str = "Transferred";

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last_indication(&self) -> Option<ControlKind> {
        *self.last_indication.lock()
    }

    /// Masquerade `channel` into a fresh `<prefix>/<name>` holding channel
    /// and return the holder, which from then on carries the endpoint
    pub fn adopt(self: &Arc<Self>, registry: &Arc<ChannelRegistry>, prefix: &str, channel: &Arc<Channel>) -> Result<Arc<Channel>> {
        let location = channel.location();
        let holder = registry
            .channel(self.clone(), format!("{}/{}", prefix, channel.name()))
            .formats(channel.native_formats())
            .extension(location.context.clone(), location.exten.clone())
            .build()?;
        holder.set_location(location.context, location.exten, location.priority);
        holder.set_account_code(channel.account_code());

        let formats = holder
            .set_read_format(channel.read_format())
            .and_then(|_| holder.set_write_format(channel.write_format()));
        if let Err(e) = formats.and_then(|_| masquerade::masquerade(&holder, channel)) {
            holder.hangup().ok();
            return Err(e);
        }
        debug!("{} now carries {}", holder.name(), channel.name());
        Ok(holder)
    }
}

impl ChannelTech for HoldingTech {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn description(&self) -> &'static str {
        "Placeholder for calls nobody services"
    }

    fn capabilities(&self) -> FormatSet {
        FormatSet::from_formats(&[Format::Slin8, Format::Ulaw, Format::Alaw])
    }

    fn hangup(&self, call: &TechCall) -> Result<()> {
        debug!("Holding channel {} released", call.channel().name());
        Ok(())
    }

    fn write(&self, _call: &TechCall, _frame: &Frame) -> Result<()> {
        Ok(())
    }

    fn indicate(&self, _call: &TechCall, condition: ControlKind, _data: &[u8]) -> Result<()> {
        *self.last_indication.lock() = Some(condition);
        Ok(())
    }
}
