//! Masquerade
//!
//! A masquerade moves everything that makes a channel talk to its endpoint
//! (technology, private state, formats, queued frames, datastores, frame
//! hooks, party information) from a *source* channel into a *destination*
//! channel. Whoever holds the destination keeps a working handle; the
//! source is left as a zombie whose only remaining use is disposal.
//!
//! It runs in two phases. [`plan`] marks both channels and wakes the
//! destination; [`execute`] does the swap and is run either straight away
//! by [`masquerade`] or by the destination's next read, write or hang-up.
//!
//! Locking: the registry gate is taken first, then both channel locks in
//! ascending [`Channel::order`]. Technology fix-ups run with the gate held
//! and the channel locks released. Datastore fix-ups, indications and any
//! deferred hang-up run after the gate is released.

use std::mem;
use std::sync::Arc;

use rvoip_media_core::{ControlKind, Format, Frame};
use tracing::{debug, info, warn};

use crate::channel::{lock_pair, Channel, ChannelInner, Datastore, MasqRole, SoftHangup};
use crate::error::{Result, SwitchError};
use crate::generator::ActiveGenerator;
use crate::tech::TechCall;

const MASQ_SUFFIX: &str = "<MASQ>";
const ZOMBIE_SUFFIX: &str = "<ZOMBIE>";

/// Masquerade `src` into `dest` and carry it out right away
pub fn masquerade(dest: &Arc<Channel>, src: &Arc<Channel>) -> Result<()> {
    plan(dest, src)?;
    execute(dest)
}

/// Mark `src` to be masqueraded into `dest`
///
/// Refused without touching either channel when they are the same channel,
/// when either is a zombie, or when either already takes part in a
/// masquerade.
pub fn plan(dest: &Arc<Channel>, src: &Arc<Channel>) -> Result<()> {
    if Arc::ptr_eq(dest, src) {
        return Err(SwitchError::masquerade("cannot masquerade a channel into itself"));
    }

    let registry = dest.registry();
    let _gate = registry.as_ref().map(|r| r.gate());
    let (mut d, mut s) = lock_pair(dest, src);

    for inner in [&*d, &*s] {
        if inner.flags.zombie {
            warn!("Refusing masquerade {} <- {}: {} is a zombie", d.name, s.name, inner.name);
            return Err(SwitchError::masquerade(format!("{} is a zombie", inner.name)));
        }
        if inner.masq.is_some() {
            warn!(
                "Refusing masquerade {} <- {}: {} is already being masqueraded",
                d.name, s.name, inner.name
            );
            return Err(SwitchError::masquerade(format!("{} already has a masquerade pending", inner.name)));
        }
    }

    d.masq = Some(MasqRole::Destination(src.clone()));
    s.masq = Some(MasqRole::Source(Arc::downgrade(dest)));
    d.readq.push_back(Frame::null());
    s.readq.push_back(Frame::null());
    debug!("Planned masquerade of {} into {}", s.name, d.name);
    drop((d, s));

    dest.wake();
    src.wake();
    Ok(())
}

/// What is left to do once the locks are gone
struct Aftermath {
    zombie: Arc<Channel>,
    datastores: Vec<Datastore>,
    released_generators: [Option<ActiveGenerator>; 2],
    reindicate: Option<ControlKind>,
    hangup_zombie: bool,
}

/// Carry out the masquerade `dest` is the destination of
///
/// Returns `Ok` without doing anything when another caller got there first.
pub(crate) fn execute(dest: &Arc<Channel>) -> Result<()> {
    let registry = dest.registry();
    let gate = registry.as_ref().map(|r| r.gate());

    let src = {
        let inner = dest.inner.lock();
        match &inner.masq {
            Some(MasqRole::Destination(src)) => src.clone(),
            _ => return Ok(()),
        }
    };

    let (mut d, mut s) = lock_pair(dest, &src);
    let paired = matches!(&s.masq, Some(MasqRole::Source(w)) if w.upgrade().is_some_and(|c| Arc::ptr_eq(&c, dest)));
    d.masq = None;
    s.masq = None;
    if !paired {
        warn!("Masquerade of {} into {} lost its source side", s.name, d.name);
        return Err(SwitchError::masquerade(format!("{} is no longer a masquerade source", s.name)));
    }

    info!("🎭 Masquerading {} into {}", s.name, d.name);

    if let Some(registry) = &registry {
        registry.unlink(dest, &d.name, &d.unique_id);
        registry.unlink(&src, &s.name, &s.unique_id);
    }

    let dest_old_name = mem::take(&mut d.name);
    let dest_old_id = mem::take(&mut d.unique_id);
    d.name = mem::replace(&mut s.name, format!("{}{}", dest_old_name, MASQ_SUFFIX));
    d.unique_id = mem::replace(&mut s.unique_id, dest_old_id);
    let (read_format, write_format) = (d.read_format, d.write_format);
    let reindicate = d.visible_indication;

    swap_implementation(&mut d, &mut s);

    // the source's frames come first
    let mut readq = mem::take(&mut s.readq);
    let moved = readq.len();
    readq.append(&mut d.readq);
    d.readq = readq;

    d.state = mem::replace(&mut s.state, d.state);
    s.softhangup.insert(SoftHangup::DEV);

    d.language = s.language.clone();
    d.account_code = s.account_code.clone();
    d.flags.outgoing |= s.flags.outgoing;
    for (key, value) in &s.variables {
        d.variables.entry(key.clone()).or_insert_with(|| value.clone());
    }

    mem::swap(&mut d.caller, &mut s.caller);
    mem::swap(&mut d.connected, &mut s.connected);
    mem::swap(&mut d.redirecting, &mut s.redirecting);
    mem::swap(&mut d.dialed, &mut s.dialed);

    let datastores = mem::take(&mut s.datastores);
    d.datastores.extend(datastores.iter().cloned());
    d.framehooks.absorb(&mut s.framehooks);

    if let Err(e) = d.rebuild_read_path(read_format) {
        warn!("Cannot restore read format {} on {}: {}", read_format, d.name, e);
        reset_paths(&mut d);
    }
    if let Err(e) = d.rebuild_write_path(write_format) {
        warn!("Cannot restore write format {} on {}: {}", write_format, d.name, e);
        reset_paths(&mut d);
    }
    reset_paths(&mut s);

    let released_generators = [d.generator.take(), s.generator.take()];
    s.bridged = None;
    s.visible_indication = None;
    let hangup_zombie = mem::take(&mut s.flags.hangup_after_masquerade);

    let (zombie_tech, zombie_pvt) = (s.tech.clone(), s.pvt.clone());
    let (dest_tech, dest_pvt) = (d.tech.clone(), d.pvt.clone());
    let dest_name = d.name.clone();
    drop((d, s));

    if moved > 0 {
        debug!("Moved {} queued frames into {}", moved, dest_name);
    }

    // the zombie now carries the technology the destination used to have
    if let Err(e) = zombie_tech.fixup(dest, &src, zombie_pvt.as_ref()) {
        warn!("{} fixup of zombie {} failed: {}", zombie_tech.type_name(), src.name(), e);
    }
    let zombie_call = TechCall::new(src.clone(), zombie_pvt);
    if let Err(e) = zombie_tech.hangup(&zombie_call) {
        warn!("{} hangup of zombie {} failed: {}", zombie_tech.type_name(), src.name(), e);
    }

    let fixup = dest_tech.fixup(&src, dest, dest_pvt.as_ref());

    {
        let mut s = src.inner.lock();
        s.name = format!("{}{}", dest_old_name, ZOMBIE_SUFFIX);
        s.flags.zombie = true;
        s.readq.push_back(Frame::null());
    }

    if let Some(registry) = &registry {
        let (name, id) = {
            let d = dest.inner.lock();
            (d.name.clone(), d.unique_id.clone())
        };
        registry.link(dest, &name, &id);
        let (name, id) = {
            let s = src.inner.lock();
            (s.name.clone(), s.unique_id.clone())
        };
        registry.link(&src, &name, &id);
    }
    drop(gate);

    if let Err(e) = fixup {
        warn!("{} fixup of {} failed: {}", dest_tech.type_name(), dest_name, e);
        dest.softhangup(SoftHangup::DEV);
        src.wake();
        return Err(e);
    }

    finish(
        dest,
        Aftermath {
            zombie: src,
            datastores,
            released_generators,
            reindicate,
            hangup_zombie,
        },
    );
    Ok(())
}

/// Exchange technology, private state and everything tied to the endpoint
fn swap_implementation(d: &mut ChannelInner, s: &mut ChannelInner) {
    mem::swap(&mut d.tech, &mut s.tech);
    mem::swap(&mut d.pvt, &mut s.pvt);
    mem::swap(&mut d.native_formats, &mut s.native_formats);
    mem::swap(&mut d.raw_read_format, &mut s.raw_read_format);
    mem::swap(&mut d.raw_write_format, &mut s.raw_write_format);
    mem::swap(&mut d.jitter, &mut s.jitter);
    mem::swap(&mut d.flags.tech_readable, &mut s.flags.tech_readable);
    mem::swap(
        &mut d.flags.write_interrupts_generator,
        &mut s.flags.write_interrupts_generator,
    );
    d.read_trans = None;
    d.write_trans = None;
    s.read_trans = None;
    s.write_trans = None;
}

/// Fall back to untranslated audio in the best native format
fn reset_paths(inner: &mut ChannelInner) {
    let format = inner.native_formats.best_audio().unwrap_or(Format::Slin8);
    inner.read_trans = None;
    inner.write_trans = None;
    inner.read_format = format;
    inner.write_format = format;
    inner.raw_read_format = format;
    inner.raw_write_format = format;
}

fn finish(dest: &Arc<Channel>, aftermath: Aftermath) {
    let Aftermath {
        zombie,
        datastores,
        released_generators,
        reindicate,
        hangup_zombie,
    } = aftermath;

    let [dest_generator, zombie_generator] = released_generators;
    dest.release_generator(dest_generator);
    zombie.release_generator(zombie_generator);

    for datastore in &datastores {
        datastore.run_fixup(&zombie, dest);
    }

    if let Some(condition) = reindicate {
        if let Err(e) = dest.indicate(condition) {
            debug!("Could not re-indicate {:?} on {}: {}", condition, dest.name(), e);
        }
    }

    if let Err(e) = dest.indicate(ControlKind::SrcChange) {
        debug!("SrcChange not delivered to {}: {}", dest.name(), e);
    }
    if let Some(peer) = dest.bridged_peer() {
        if let Err(e) = peer.indicate(ControlKind::SrcChange) {
            debug!("SrcChange not delivered to {}: {}", peer.name(), e);
        }
    }

    dest.wake();
    zombie.wake();
    info!("🎭 Masquerade complete: {} now zombie {}", dest.name(), zombie.name());

    if hangup_zombie {
        if let Err(e) = zombie.hangup() {
            warn!("Deferred hangup of {} failed: {}", zombie.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelOptions, ChannelState};
    use crate::registry::ChannelRegistry;
    use crate::tech::mock::{MockEndpoint, MockTech};

    fn setup() -> (Arc<ChannelRegistry>, Arc<MockTech>) {
        (ChannelRegistry::new(ChannelOptions::default()), Arc::new(MockTech::new("Mock")))
    }

    #[test]
    fn test_plan_refuses_self_and_double_booking() {
        let (registry, tech) = setup();
        let (a, _) = tech.create(&registry, "Mock/a").unwrap();
        let (b, _) = tech.create(&registry, "Mock/b").unwrap();
        let (c, _) = tech.create(&registry, "Mock/c").unwrap();

        assert!(plan(&a, &a).is_err());
        plan(&a, &b).unwrap();
        assert!(matches!(plan(&c, &b), Err(SwitchError::MasqueradeRefused(_))));
        assert!(matches!(plan(&a, &c), Err(SwitchError::MasqueradeRefused(_))));
        // the refused attempts left c untouched
        assert!(c.inner.lock().masq.is_none());
    }

    #[test]
    fn test_swap_names_and_endpoints() {
        let (registry, tech) = setup();
        let (dest, dest_ep) = tech.create(&registry, "Mock/dest").unwrap();
        let (src, src_ep) = tech.create(&registry, "Mock/src").unwrap();
        let src_id = src.unique_id();
        src.set_state(ChannelState::Ringing);

        masquerade(&dest, &src).unwrap();

        assert_eq!(dest.name(), "Mock/src");
        assert_eq!(dest.unique_id(), src_id);
        assert_eq!(dest.state(), ChannelState::Ringing);
        assert_eq!(src.name(), "Mock/dest<ZOMBIE>");
        assert!(src.is_zombie());

        let pvt = dest.tech_pvt().unwrap().downcast::<MockEndpoint>().unwrap();
        assert_eq!(pvt.label(), src_ep.label());
        assert_eq!(dest_ep.hangups(), 1);
        assert_eq!(src_ep.hangups(), 0);

        assert!(Arc::ptr_eq(&registry.find_by_name("Mock/src").unwrap(), &dest));
        assert!(Arc::ptr_eq(&registry.find_by_unique_id(&src_id).unwrap(), &dest));
        assert!(registry.find_by_name("Mock/dest").is_none());
    }

    #[test]
    fn test_zombie_cannot_be_masqueraded() {
        let (registry, tech) = setup();
        let (a, _) = tech.create(&registry, "Mock/a").unwrap();
        let (b, _) = tech.create(&registry, "Mock/b").unwrap();
        let (c, _) = tech.create(&registry, "Mock/c").unwrap();
        masquerade(&a, &b).unwrap();

        let before = c.name();
        assert!(masquerade(&c, &b).is_err());
        assert_eq!(c.name(), before);
        assert!(c.inner.lock().masq.is_none());
    }
}
