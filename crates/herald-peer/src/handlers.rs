use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::channel::Incoming;

/// Callback for decoded messages of one schema.
pub type MessageHandler = Arc<dyn Fn(Incoming) + Send + Sync>;

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// One replaceable handler slot per schema index.
pub(crate) struct HandlerTable {
    slots: Vec<RwLock<Option<MessageHandler>>>,
}

impl HandlerTable {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| RwLock::new(None)).collect(),
        }
    }

    /// Replace the handler for `index`.
    pub(crate) fn set(&self, index: u8, handler: MessageHandler) {
        if let Some(slot) = self.slots.get(index as usize) {
            *write(slot) = Some(handler);
        }
    }

    pub(crate) fn get(&self, index: u8) -> Option<MessageHandler> {
        self.slots
            .get(index as usize)
            .and_then(|slot| read(slot).clone())
    }

    /// Drop every handler, releasing whatever they captured.
    pub(crate) fn clear(&self) {
        for slot in &self.slots {
            *write(slot) = None;
        }
    }
}
