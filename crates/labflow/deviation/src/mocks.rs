//! Recording publisher for tests.

use crate::{CapaEvent, CapaPublisher, PublishError};
use async_trait::async_trait;
use parking_lot::Mutex;

/// Keeps every delivered event; can be told to refuse deliveries.
#[derive(Default)]
pub struct RecordingCapaPublisher {
    delivered: Mutex<Vec<CapaEvent>>,
    refuse: Mutex<u32>,
}

impl RecordingCapaPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` deliveries.
    pub fn refuse_next(&self, count: u32) {
        *self.refuse.lock() = count;
    }

    pub fn delivered(&self) -> Vec<CapaEvent> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl CapaPublisher for RecordingCapaPublisher {
    async fn publish(&self, event: &CapaEvent) -> Result<(), PublishError> {
        {
            let mut refuse = self.refuse.lock();
            if *refuse > 0 {
                *refuse -= 1;
                return Err(PublishError("refused".into()));
            }
        }
        self.delivered.lock().push(event.clone());
        Ok(())
    }
}
