use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::domain::GridLoadState;

/// Thread-safe FIFO carrying measurement samples from the meter producers to
/// the controller.
///
/// The consumer side intentionally coalesces: `try_pop_latest` drains the
/// whole backlog and hands out only the newest element, because the
/// controller always wants to react to the freshest grid sample and older
/// ones are stale by definition.
#[derive(Default)]
pub struct MeasurementBus {
    queue: Mutex<VecDeque<GridLoadState>>,
}

impl MeasurementBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, state: GridLoadState) {
        self.queue.lock().push_back(state);
    }

    /// Non-blocking fetch of the newest sample.
    ///
    /// Returns `false` and leaves `out` untouched when the bus is empty.
    /// Otherwise writes the most recently pushed element into `out`, discards
    /// everything older and returns `true`; the bus is empty afterwards.
    pub fn try_pop_latest(&self, out: &mut GridLoadState) -> bool {
        let mut queue = self.queue.lock();
        match queue.pop_back() {
            Some(latest) => {
                queue.clear();
                *out = latest;
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}
