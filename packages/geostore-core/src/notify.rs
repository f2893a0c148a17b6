use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Change codes delivered to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ChangeCode {
    CreateObject = 1 << 0,
    DeleteObject = 1 << 1,
    ChangeObject = 1 << 2,
    CreateFeature = 1 << 3,
    ChangeFeature = 1 << 4,
    DeleteFeature = 1 << 5,
    DeleteAllFeatures = 1 << 6,
    CreateAttachment = 1 << 7,
    ChangeAttachment = 1 << 8,
    DeleteAttachment = 1 << 9,
    DeleteAllAttachments = 1 << 10,
    CreateMap = 1 << 11,
}

impl ChangeCode {
    pub const ALL: u32 = u32::MAX;

    pub fn mask(self) -> u32 {
        self as u32
    }

    pub fn from_mask(mask: u32) -> Option<Self> {
        const CODES: [ChangeCode; 12] = [
            ChangeCode::CreateObject,
            ChangeCode::DeleteObject,
            ChangeCode::ChangeObject,
            ChangeCode::CreateFeature,
            ChangeCode::ChangeFeature,
            ChangeCode::DeleteFeature,
            ChangeCode::DeleteAllFeatures,
            ChangeCode::CreateAttachment,
            ChangeCode::ChangeAttachment,
            ChangeCode::DeleteAttachment,
            ChangeCode::DeleteAllAttachments,
            ChangeCode::CreateMap,
        ];
        CODES.into_iter().find(|c| c.mask() == mask)
    }
}

type Listener = Arc<dyn Fn(&str, ChangeCode) + Send + Sync>;

/// Observer hub for object and feature changes.
///
/// Owned by the host and shared with datasets and map registries.
#[derive(Default)]
pub struct Notify {
    listeners: RwLock<Vec<(u32, Listener)>>,
    suppressed: AtomicBool,
}

impl Notify {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener<F>(&self, mask: u32, listener: F)
    where
        F: Fn(&str, ChangeCode) + Send + Sync + 'static,
    {
        self.listeners.write().push((mask, Arc::new(listener)));
    }

    pub fn set_suppressed(&self, suppressed: bool) {
        self.suppressed.store(suppressed, Ordering::SeqCst);
    }

    pub fn notify(&self, uri: &str, code: ChangeCode) {
        if self.suppressed.load(Ordering::SeqCst) {
            return;
        }
        // Clone out so listeners may register further listeners.
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .filter(|(mask, _)| mask & code.mask() != 0)
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(uri, code);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Records every notification for assertions.
    pub fn recorder(notify: &Notify) -> Arc<Mutex<Vec<(String, ChangeCode)>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        notify.add_listener(ChangeCode::ALL, move |uri, code| {
            sink.lock().push((uri.to_string(), code));
        });
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_filters_codes() {
        let notify = Notify::new();
        let events = testing::recorder(&notify);
        let deletes = Arc::new(parking_lot::Mutex::new(0));
        let counter = Arc::clone(&deletes);
        notify.add_listener(ChangeCode::DeleteFeature.mask(), move |_, _| {
            *counter.lock() += 1;
        });

        notify.notify("a#1", ChangeCode::CreateFeature);
        notify.notify("a#1", ChangeCode::DeleteFeature);

        assert_eq!(events.lock().len(), 2);
        assert_eq!(*deletes.lock(), 1);
    }

    #[test]
    fn suppressed_drops_events() {
        let notify = Notify::new();
        let events = testing::recorder(&notify);
        notify.set_suppressed(true);
        notify.notify("x", ChangeCode::ChangeObject);
        assert!(events.lock().is_empty());
    }
}
