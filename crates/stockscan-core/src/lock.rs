use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::models::ResourceCategory;

/// Non-blocking exclusive gate, one flag per resource category. The external
/// analysis processes are too heavy to run twice concurrently, so a second
/// caller gets an immediate rejection instead of queueing.
pub struct SingleFlight {
    flags: HashMap<ResourceCategory, Arc<AtomicBool>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        let flags = ResourceCategory::ALL
            .iter()
            .map(|category| (*category, Arc::new(AtomicBool::new(false))))
            .collect();
        Self { flags }
    }

    /// Atomic test-and-set. Returns `None` without blocking when the
    /// category is already held; the returned guard releases on drop.
    pub fn try_acquire(&self, category: ResourceCategory) -> Option<FlightGuard> {
        let flag = self.flag(category);
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(FlightGuard {
            category,
            flag: flag.clone(),
        })
    }

    pub fn is_held(&self, category: ResourceCategory) -> bool {
        self.flag(category).load(Ordering::Acquire)
    }

    /// Unconditional clear. Idempotent; the guard's drop is the normal
    /// release path, this exists for explicit recovery.
    pub fn release(&self, category: ResourceCategory) {
        self.flag(category).store(false, Ordering::Release);
    }

    fn flag(&self, category: ResourceCategory) -> &Arc<AtomicBool> {
        // Every category is preallocated in `new`.
        &self.flags[&category]
    }
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FlightGuard {
    category: ResourceCategory,
    flag: Arc<AtomicBool>,
}

impl FlightGuard {
    pub fn category(&self) -> ResourceCategory {
        self.category
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
