//! Typed data attached to a channel
//!
//! Applications hang state off a channel as [`Datastore`]s keyed by a
//! static type key and an optional instance uid. A masquerade moves every
//! datastore of the source to the destination and runs its fixup hook.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::Channel;

/// Called with (datastore, old channel, new channel) after a masquerade moved it
pub type DatastoreFixup = Arc<dyn Fn(&Datastore, &Arc<Channel>, &Arc<Channel>) + Send + Sync>;

/// A value attached to a channel
#[derive(Clone)]
pub struct Datastore {
    key: &'static str,
    uid: Option<String>,
    inherit: bool,
    value: Arc<dyn Any + Send + Sync>,
    fixup: Option<DatastoreFixup>,
}

impl Datastore {
    pub fn new<T: Any + Send + Sync>(key: &'static str, value: T) -> Self {
        Self {
            key,
            uid: None,
            inherit: false,
            value: Arc::new(value),
            fixup: None,
        }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    /// Copy the datastore to channels created on behalf of its owner
    pub fn inheritable(mut self) -> Self {
        self.inherit = true;
        self
    }

    pub fn on_fixup<F>(mut self, fixup: F) -> Self
    where
        F: Fn(&Datastore, &Arc<Channel>, &Arc<Channel>) + Send + Sync + 'static,
    {
        self.fixup = Some(Arc::new(fixup));
        self
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_inheritable(&self) -> bool {
        self.inherit
    }

    /// The stored value, if it is a `T`
    pub fn value<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.value.clone().downcast::<T>().ok()
    }

    fn matches(&self, key: &str, uid: Option<&str>) -> bool {
        self.key == key && (uid.is_none() || self.uid.as_deref() == uid)
    }

    pub(crate) fn run_fixup(&self, old: &Arc<Channel>, new: &Arc<Channel>) {
        if let Some(fixup) = &self.fixup {
            fixup(self, old, new);
        }
    }
}

impl fmt::Debug for Datastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datastore")
            .field("key", &self.key)
            .field("uid", &self.uid)
            .field("inherit", &self.inherit)
            .finish()
    }
}

impl Channel {
    pub fn add_datastore(&self, datastore: Datastore) {
        self.inner.lock().datastores.push(datastore);
    }

    /// Find a datastore by key, and by uid when one is given
    pub fn find_datastore(&self, key: &str, uid: Option<&str>) -> Option<Datastore> {
        self.inner
            .lock()
            .datastores
            .iter()
            .find(|d| d.matches(key, uid))
            .cloned()
    }

    pub fn remove_datastore(&self, key: &str, uid: Option<&str>) -> Option<Datastore> {
        let mut inner = self.inner.lock();
        let pos = inner.datastores.iter().position(|d| d.matches(key, uid))?;
        Some(inner.datastores.remove(pos))
    }

    pub fn datastore_count(&self) -> usize {
        self.inner.lock().datastores.len()
    }

    /// Copy inheritable datastores onto a channel created for this one
    pub fn inherit_datastores(&self, to: &Channel) -> usize {
        let inherited: Vec<Datastore> = self
            .inner
            .lock()
            .datastores
            .iter()
            .filter(|d| d.inherit)
            .cloned()
            .collect();
        let count = inherited.len();
        if count > 0 {
            debug!("Inheriting {} datastores from {} to {}", count, self.name(), to.name());
            to.inner.lock().datastores.extend(inherited);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_key_and_uid() {
        let a = Datastore::new("spy", 1u32).with_uid("a");
        let b = Datastore::new("spy", 2u32).with_uid("b");
        assert!(a.matches("spy", None));
        assert!(a.matches("spy", Some("a")));
        assert!(!a.matches("spy", Some("b")));
        assert_eq!(b.value::<u32>().as_deref(), Some(&2));
        assert!(b.value::<String>().is_none());
    }
}
