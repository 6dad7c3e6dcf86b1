use ffp_core::OperationalCode;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::debug;

/// Single-slot mailbox of one screen; only the newest code is ever observed.
#[derive(Debug)]
pub struct Inbox {
    rx: watch::Receiver<Option<OperationalCode>>,
}

impl Inbox {
    /// Waits for the next publication. `None` once the distributor is gone.
    pub async fn recv(&mut self) -> Option<OperationalCode> {
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            if let Some(code) = *self.rx.borrow_and_update() {
                return Some(code);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Slots {
    screens: Vec<(String, watch::Sender<Option<OperationalCode>>)>,
    last: Option<OperationalCode>,
}

/// Fan-out of the poller's code to every registered screen. Clones share the same slots.
#[derive(Debug, Clone, Default)]
pub struct Distributor {
    slots: Arc<RwLock<Slots>>,
}

impl Distributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a fresh inbox for `screen`, replacing any previous one under that name.
    /// The inbox starts with the last published code, if any.
    pub fn register(&self, screen: &str) -> Inbox {
        let (tx, rx) = watch::channel(None);
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(code) = slots.last {
            tx.send_replace(Some(code));
        }
        match slots.screens.iter_mut().find(|(name, _)| name == screen) {
            Some(slot) => slot.1 = tx,
            None => slots.screens.push((screen.to_string(), tx)),
        }
        Inbox { rx }
    }

    /// Overwrites every inbox with `code`. Never blocks on a slow reader.
    pub fn publish(&self, code: OperationalCode) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots.last = Some(code);
        for (screen, tx) in &slots.screens {
            tx.send_replace(Some(code));
            debug!(event = "status_delivered", screen = %screen, code = %code);
        }
    }

    pub fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .screens
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
