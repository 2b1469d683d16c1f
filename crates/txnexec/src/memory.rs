use parking_lot::Mutex;
use tracing::{debug, warn};

/// Memory set aside at startup and handed back when an allocation fails, so
/// rolling back has room to work.
#[derive(Debug)]
pub struct MemoryReserve {
    size: usize,
    reserve: Mutex<Option<Vec<u8>>>,
}

impl MemoryReserve {
    pub fn new(size: usize) -> Self {
        MemoryReserve {
            size,
            reserve: Mutex::new(Some(vec![0; size])),
        }
    }

    /// Free the reserve. Returns false if it was already freed.
    pub fn release(&self) -> bool {
        let freed = self.reserve.lock().take().is_some();
        if freed {
            warn!(bytes = self.size, "released memory reserve");
        }
        freed
    }

    /// Allocate the reserve again if it was freed.
    pub fn replenish(&self) {
        let mut reserve = self.reserve.lock();
        if reserve.is_none() {
            debug!(bytes = self.size, "replenishing memory reserve");
            *reserve = Some(vec![0; self.size]);
        }
    }

    pub fn is_held(&self) -> bool {
        self.reserve.lock().is_some()
    }
}
