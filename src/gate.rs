//! Service lifecycle gate.
//!
//! The gate is a two-state machine (`Stopped` / `Started`) that decides whether
//! streamed events may reach subscribers. `stop` flips the state *before* the
//! engine is told to stop, so events racing in during teardown are already
//! suppressed when they arrive.
//!
//! Deliveries run under a [`DeliveryPermit`]: a shared hold on the gate that
//! `stop` waits out before returning. Once `stop` returns, no handler is
//! running and none will start until the next `start`. A handler may itself
//! call `stop`; that call does not wait for the delivery it is part of.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BridgeError, BridgeResult};

/// Lifecycle state of the engine as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Events are dropped.
    Stopped,
    /// Events are delivered.
    Started,
}

impl ServiceState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Started => 1,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        if raw == 1 {
            Self::Started
        } else {
            Self::Stopped
        }
    }
}

/// Start/stop forwarding target for the gate.
///
/// Implemented by the boundary client (forwarding over the transport) and by
/// anything that drives an engine directly.
pub trait ServiceControl: Send + Sync {
    /// Ask the engine to begin accepting queries.
    fn start_service(&self) -> BridgeResult<()>;

    /// Ask the engine to stop accepting queries.
    fn stop_service(&self) -> BridgeResult<()>;
}

thread_local! {
    // Gates this thread currently holds a delivery permit for.
    static DELIVERING: RefCell<Vec<usize>> = RefCell::new(Vec::new());
}

/// Two-state lifecycle gate.
pub struct ServiceGate {
    state: AtomicU8,
    // Serializes transitions; never held by readers.
    transition: Mutex<()>,
    // Shared by in-flight deliveries, taken exclusively by `stop` to drain them.
    delivery: RwLock<()>,
    control: Arc<dyn ServiceControl>,
}

/// Held while one subscriber handler runs.
///
/// Obtained from [`ServiceGate::delivery_permit`] only while the gate is
/// started.
pub struct DeliveryPermit<'a> {
    gate_id: usize,
    _shared: Option<RwLockReadGuard<'a, ()>>,
}

impl Drop for DeliveryPermit<'_> {
    fn drop(&mut self) {
        DELIVERING.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|id| *id == self.gate_id) {
                held.remove(pos);
            }
        });
    }
}

impl std::fmt::Debug for ServiceGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceGate").field("state", &self.state()).finish_non_exhaustive()
    }
}

impl ServiceGate {
    /// Create a gate in the `Stopped` state.
    pub fn new(control: Arc<dyn ServiceControl>) -> Self {
        Self {
            state: AtomicU8::new(ServiceState::Stopped.as_u8()),
            transition: Mutex::new(()),
            delivery: RwLock::new(()),
            control,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True while events may be delivered.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state() == ServiceState::Started
    }

    /// Transition to `Started` and forward the start request.
    ///
    /// Calling this while already started is allowed; the engine sees the
    /// repeated request. If forwarding fails the gate falls back to `Stopped`.
    /// Returns the state before the call.
    pub fn start(&self) -> BridgeResult<ServiceState> {
        let _guard = self.lock_transition()?;

        let prior = self.swap(ServiceState::Started);
        debug!(?prior, "service gate -> started");

        if let Err(err) = self.control.start_service() {
            self.swap(ServiceState::Stopped);
            warn!(error = %err, "engine start failed; gate reverted to stopped");
            return Err(err);
        }

        Ok(prior)
    }

    /// Transition to `Stopped`, then forward the stop request.
    ///
    /// The state flips first regardless of whether forwarding succeeds. Before
    /// returning, waits for handlers that were admitted before the flip.
    /// Returns the state before the call.
    pub fn stop(&self) -> BridgeResult<ServiceState> {
        let (prior, forwarded) = {
            let _guard = self.lock_transition()?;
            let prior = self.swap(ServiceState::Stopped);
            debug!(?prior, "service gate -> stopped");
            (prior, self.control.stop_service())
        };

        // Outside the transition lock: a draining handler may call start/stop.
        self.drain_deliveries()?;
        forwarded.map(|()| prior)
    }

    /// Admit one handler invocation.
    ///
    /// Returns `None` once the gate is stopped. While the permit is alive,
    /// `stop` on another thread does not return.
    pub fn delivery_permit(&self) -> BridgeResult<Option<DeliveryPermit<'_>>> {
        let shared = if self.delivering_here() {
            // Already holding a shared guard further up this thread's stack.
            None
        } else {
            Some(
                self.delivery
                    .read()
                    .map_err(|_| BridgeError::internal("service gate delivery lock poisoned"))?,
            )
        };

        if !self.is_started() {
            return Ok(None);
        }

        let gate_id = self.id();
        DELIVERING.with(|held| held.borrow_mut().push(gate_id));
        Ok(Some(DeliveryPermit {
            gate_id,
            _shared: shared,
        }))
    }

    fn drain_deliveries(&self) -> BridgeResult<()> {
        if self.delivering_here() {
            return Ok(());
        }
        drop(
            self.delivery
                .write()
                .map_err(|_| BridgeError::internal("service gate delivery lock poisoned"))?,
        );
        Ok(())
    }

    fn delivering_here(&self) -> bool {
        let id = self.id();
        DELIVERING.with(|held| held.borrow().contains(&id))
    }

    fn id(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    fn swap(&self, next: ServiceState) -> ServiceState {
        ServiceState::from_u8(self.state.swap(next.as_u8(), Ordering::AcqRel))
    }

    fn lock_transition(&self) -> BridgeResult<std::sync::MutexGuard<'_, ()>> {
        self.transition
            .lock()
            .map_err(|_| BridgeError::internal("service gate lock poisoned"))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// Records forwarded calls; optionally fails start.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingControl {
        pub starts: AtomicUsize,
        pub stops: AtomicUsize,
        pub fail_start: AtomicBool,
    }

    impl ServiceControl for RecordingControl {
        fn start_service(&self) -> BridgeResult<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(BridgeError::internal("engine refused to start"));
            }
            Ok(())
        }

        fn stop_service(&self) -> BridgeResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn gate_starts_stopped() {
        let gate = ServiceGate::new(Arc::new(RecordingControl::default()));
        assert_eq!(gate.state(), ServiceState::Stopped);
        assert!(!gate.is_started());
    }

    #[test]
    fn start_and_stop_forward_to_control() {
        let control = Arc::new(RecordingControl::default());
        let gate = ServiceGate::new(control.clone());

        assert_eq!(gate.start().unwrap(), ServiceState::Stopped);
        assert!(gate.is_started());
        assert_eq!(gate.stop().unwrap(), ServiceState::Started);
        assert!(!gate.is_started());

        assert_eq!(control.starts.load(Ordering::SeqCst), 1);
        assert_eq!(control.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repeated_start_is_harmless_and_forwarded() {
        let control = Arc::new(RecordingControl::default());
        let gate = ServiceGate::new(control.clone());

        gate.start().unwrap();
        assert_eq!(gate.start().unwrap(), ServiceState::Started);
        assert!(gate.is_started());
        assert_eq!(control.starts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_start_reverts_to_stopped() {
        let control = Arc::new(RecordingControl::default());
        control.fail_start.store(true, Ordering::SeqCst);
        let gate = ServiceGate::new(control);

        assert!(gate.start().is_err());
        assert!(!gate.is_started());
    }

    struct ObservingControl {
        gate: Mutex<Option<Arc<ServiceGate>>>,
        started_during_stop: AtomicBool,
    }

    impl ServiceControl for ObservingControl {
        fn start_service(&self) -> BridgeResult<()> {
            Ok(())
        }

        fn stop_service(&self) -> BridgeResult<()> {
            let guard = self.gate.lock().unwrap();
            let gate = guard.as_ref().unwrap();
            self.started_during_stop.store(gate.is_started(), Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn stop_flips_state_before_forwarding() {
        let control = Arc::new(ObservingControl {
            gate: Mutex::new(None),
            started_during_stop: AtomicBool::new(true),
        });
        let gate = Arc::new(ServiceGate::new(control.clone()));
        *control.gate.lock().unwrap() = Some(Arc::clone(&gate));

        gate.start().unwrap();
        gate.stop().unwrap();

        assert!(!control.started_during_stop.load(Ordering::SeqCst));
    }

    #[test]
    fn permits_are_refused_while_stopped() {
        let gate = ServiceGate::new(Arc::new(RecordingControl::default()));
        assert!(gate.delivery_permit().unwrap().is_none());

        gate.start().unwrap();
        assert!(gate.delivery_permit().unwrap().is_some());
    }

    #[test]
    fn stop_under_own_permit_does_not_wait_for_itself() {
        let control = Arc::new(RecordingControl::default());
        let gate = ServiceGate::new(control.clone());
        gate.start().unwrap();

        let permit = gate.delivery_permit().unwrap();
        assert!(permit.is_some());
        assert_eq!(gate.stop().unwrap(), ServiceState::Started);
        assert!(gate.delivery_permit().unwrap().is_none());
        drop(permit);

        assert_eq!(control.stops.load(Ordering::SeqCst), 1);
        assert!(!gate.delivering_here());
    }
}
