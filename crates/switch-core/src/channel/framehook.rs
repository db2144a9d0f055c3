//! Frame interception hooks
//!
//! A [`FrameHook`] sees every frame on the read path after it leaves the
//! queue or the technology, and every frame on the write path before it
//! reaches the technology. Hooks run in attach order with the channel
//! locked, so they must not call back into the channel.

use std::fmt;
use std::sync::Arc;

use rvoip_media_core::Frame;

use super::Channel;

/// Direction a hooked frame travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHookEvent {
    Read,
    Write,
}

pub trait FrameHook: Send + Sync + 'static {
    /// Inspect or replace a frame. `None` drops it.
    fn on_frame(&self, event: FrameHookEvent, frame: Frame) -> Option<Frame>;
}

#[derive(Default)]
pub(crate) struct FrameHookList {
    next_id: u64,
    hooks: Vec<(u64, Arc<dyn FrameHook>)>,
}

impl FrameHookList {
    pub fn attach(&mut self, hook: Arc<dyn FrameHook>) -> u64 {
        self.next_id += 1;
        self.hooks.push((self.next_id, hook));
        self.next_id
    }

    pub fn detach(&mut self, id: u64) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|(hid, _)| *hid != id);
        self.hooks.len() != before
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Move every hook of `other` to the end of this list
    pub fn absorb(&mut self, other: &mut FrameHookList) {
        for (_, hook) in other.hooks.drain(..) {
            self.attach(hook);
        }
    }

    pub fn run(&self, event: FrameHookEvent, frame: Frame) -> Option<Frame> {
        let mut frame = frame;
        for (_, hook) in &self.hooks {
            frame = hook.on_frame(event, frame)?;
        }
        Some(frame)
    }
}

impl fmt::Debug for FrameHookList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHookList").field("hooks", &self.hooks.len()).finish()
    }
}

impl Channel {
    /// Attach a hook, returning its id
    pub fn attach_framehook(&self, hook: Arc<dyn FrameHook>) -> u64 {
        self.inner.lock().framehooks.attach(hook)
    }

    pub fn detach_framehook(&self, id: u64) -> bool {
        self.inner.lock().framehooks.detach(id)
    }

    pub fn framehook_count(&self) -> usize {
        self.inner.lock().framehooks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvoip_media_core::{ControlKind, FrameKind};

    struct DropText;

    impl FrameHook for DropText {
        fn on_frame(&self, _event: FrameHookEvent, frame: Frame) -> Option<Frame> {
            (frame.kind != FrameKind::Text).then_some(frame)
        }
    }

    struct Upgrade;

    impl FrameHook for Upgrade {
        fn on_frame(&self, _event: FrameHookEvent, frame: Frame) -> Option<Frame> {
            if frame.is_null() {
                Some(Frame::control(ControlKind::Progress))
            } else {
                Some(frame)
            }
        }
    }

    #[test]
    fn test_hooks_run_in_order_and_can_drop() {
        let mut list = FrameHookList::default();
        let first = list.attach(Arc::new(DropText));
        list.attach(Arc::new(Upgrade));

        assert!(list.run(FrameHookEvent::Read, Frame::text("hi")).is_none());
        let out = list.run(FrameHookEvent::Write, Frame::null()).unwrap();
        assert_eq!(out.control_kind(), Some(ControlKind::Progress));

        assert!(list.detach(first));
        assert!(!list.detach(first));
        assert!(list.run(FrameHookEvent::Read, Frame::text("hi")).is_some());
    }
}
