//! Waiting on several channels at once

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use tokio::sync::futures::Notified;
use tokio::time::Instant;

use super::{Channel, MasqRole};

enum Readiness {
    Ready,
    At(Instant),
    Idle,
}

impl Channel {
    /// Whether a read would return without waiting
    fn readiness(&self, now: Instant) -> Readiness {
        let inner = self.inner.lock();
        if inner.is_gone()
            || inner.flags.tech_readable
            || matches!(inner.masq, Some(MasqRole::Destination(_)))
        {
            return Readiness::Ready;
        }

        let holds_digits = inner.dtmf.holds_digits(now, self.options.dtmf_min_gap_ms);
        if inner
            .readq
            .iter()
            .any(|f| !(holds_digits && f.digit().is_some()))
        {
            return Readiness::Ready;
        }

        if inner.dtmf.emulating && inner.dtmf.emulate_duration_ms > 0 {
            if inner.dtmf.elapsed_ms(now) >= inner.dtmf.emulate_duration_ms {
                return Readiness::Ready;
            }
        }

        match self.next_deadline(&inner, now) {
            Some(at) if at <= now => Readiness::Ready,
            Some(at) => Readiness::At(at),
            None => Readiness::Idle,
        }
    }
}

/// Wait until one of `channels` has something to read
///
/// Returns the index of the first ready channel, or `None` on timeout.
/// A hung up channel counts as ready so its reader can notice.
pub async fn wait_for_any(channels: &[Arc<Channel>], timeout: Option<Duration>) -> Option<usize> {
    let deadline = timeout.map(|t| Instant::now() + t);

    if channels.is_empty() {
        if let Some(deadline) = deadline {
            tokio::time::sleep_until(deadline).await;
        }
        return None;
    }

    loop {
        let mut notified: Vec<Pin<Box<Notified<'_>>>> =
            channels.iter().map(|c| Box::pin(c.notify().notified())).collect();
        for n in notified.iter_mut() {
            n.as_mut().enable();
        }

        let now = Instant::now();
        let mut next = deadline;
        for (index, channel) in channels.iter().enumerate() {
            match channel.readiness(now) {
                Readiness::Ready => return Some(index),
                Readiness::At(at) => next = Some(next.map_or(at, |n| n.min(at))),
                Readiness::Idle => {}
            }
        }
        if deadline.is_some_and(|d| now >= d) {
            return None;
        }

        let woken = select_all(notified);
        match next {
            Some(at) => {
                tokio::select! {
                    _ = woken => {}
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
            None => {
                woken.await;
            }
        }
    }
}
