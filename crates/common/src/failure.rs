//! Named fault points for failure-injection testing.
//!
//! Code on a fallible path calls [`FailureInjector::reach`] with a stable
//! point name. Tests arm a point with [`FailureInjector::enable`]: after
//! `skip` passes the point fails `count` times, then disarms itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::warn;

use crate::error::{DqrError, Result};

#[derive(Debug, Clone, Copy)]
struct ArmedPoint {
    skip: u64,
    count: u64,
}

/// Registry of armed fault points.
#[derive(Debug, Default)]
pub struct FailureInjector {
    inner: Mutex<HashMap<String, ArmedPoint>>,
}

impl FailureInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `name`: let `skip` passes through, then fail the next `count`.
    pub fn enable(&self, name: &str, skip: u64, count: u64) {
        let mut points = self.inner.lock().expect("failure injector lock poisoned");
        if count == 0 {
            points.remove(name);
            return;
        }
        points.insert(name.to_string(), ArmedPoint { skip, count });
    }

    /// Disarm `name`. Returns `true` when it was armed.
    pub fn disable(&self, name: &str) -> bool {
        self.inner
            .lock()
            .expect("failure injector lock poisoned")
            .remove(name)
            .is_some()
    }

    /// Pass fault point `name`.
    ///
    /// Returns [`DqrError::Serialization`] carrying the point name when the
    /// point fires.
    pub fn reach(&self, name: &str) -> Result<()> {
        let mut points = self.inner.lock().expect("failure injector lock poisoned");
        let Some(point) = points.get_mut(name) else {
            return Ok(());
        };
        if point.skip > 0 {
            point.skip -= 1;
            return Ok(());
        }
        point.count = point.count.saturating_sub(1);
        if point.count == 0 {
            points.remove(name);
        }
        warn!(point = name, "injected failure fired");
        Err(DqrError::Serialization(name.to_string()))
    }
}

fn global_injector() -> &'static Arc<FailureInjector> {
    static INJECTOR: OnceLock<Arc<FailureInjector>> = OnceLock::new();
    INJECTOR.get_or_init(|| Arc::new(FailureInjector::new()))
}

/// Return the process-wide injector shared by default runtimes.
pub fn global_failure_injector() -> Arc<FailureInjector> {
    Arc::clone(global_injector())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unarmed_point_passes() {
        let f = FailureInjector::new();
        assert!(f.reach("p").is_ok());
    }

    #[test]
    fn skips_then_fails_count_times_then_disarms() {
        let f = FailureInjector::new();
        f.enable("p", 1, 2);
        assert!(f.reach("p").is_ok());
        let err = f.reach("p").expect_err("first failure");
        assert!(err.to_string().contains("p"));
        assert!(f.reach("p").is_err());
        assert!(f.reach("p").is_ok());
        assert!(!f.disable("p"));
    }
}
