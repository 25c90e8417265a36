use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Set of request ids currently being processed.
///
/// The same logical request can reach the daemon through the direct relay and
/// through ephemeral replication; whichever arrives first wins and the other
/// is dropped while the first is in flight. The id is released when the
/// returned [`RequestPermit`] drops, so every exit path frees it.
#[derive(Clone, Default)]
pub struct RequestGuard {
    inflight: Arc<Mutex<HashSet<String>>>,
}

impl RequestGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin(&self, request_id: &str) -> Option<RequestPermit> {
        let mut inflight = self.inflight.lock().ok()?;
        if !inflight.insert(request_id.to_string()) {
            return None;
        }
        Some(RequestPermit {
            request_id: request_id.to_string(),
            inflight: self.inflight.clone(),
        })
    }

    pub fn is_inflight(&self, request_id: &str) -> bool {
        self.inflight
            .lock()
            .map(|inflight| inflight.contains(request_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inflight.lock().map(|inflight| inflight.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[must_use = "the request id is released as soon as the permit drops"]
pub struct RequestPermit {
    request_id: String,
    inflight: Arc<Mutex<HashSet<String>>>,
}

impl RequestPermit {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Drop for RequestPermit {
    fn drop(&mut self) {
        if let Ok(mut inflight) = self.inflight.lock() {
            inflight.remove(&self.request_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_is_rejected_while_in_flight() {
        let guard = RequestGuard::new();
        let permit = guard.try_begin("req-1").expect("first delivery");
        assert!(guard.try_begin("req-1").is_none());
        assert!(guard.try_begin("req-2").is_some());
        assert!(guard.is_inflight("req-1"));

        drop(permit);
        assert!(!guard.is_inflight("req-1"));
        assert!(guard.try_begin("req-1").is_some());
    }

    #[test]
    fn permit_released_when_processing_panics() {
        let guard = RequestGuard::new();
        let cloned = guard.clone();
        let result = std::panic::catch_unwind(move || {
            let _permit = cloned.try_begin("req-panic").expect("permit");
            panic!("processing failed");
        });
        assert!(result.is_err());
        assert!(guard.is_empty());
    }
}
