//! Handle-indexed callback registry
//!
//! The registry is the only shared mutable state of the bridge. Consumer
//! threads insert and remove registrations while the daemon's notification
//! thread resolves handles, so every access goes through one `RwLock`.
//!
//! A registration walks `Unregistered -> Registering -> Active ->
//! Unregistering -> Unregistered`. Only `Active` registrations resolve.
//! `resolve` bumps the in-flight counter while still holding the read lock,
//! which makes `unregister` a clean cut: once it returns, every dispatch has
//! either been counted or will fail to resolve.

use crate::callback::EdgeCallback;
use crate::types::{BridgeError, Edge, Handle, PinId, Result};
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::time::Duration;

/// Lifecycle of a single registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Active,
    Unregistering,
}

impl RegistrationState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RegistrationState::Registering,
            2 => RegistrationState::Active,
            3 => RegistrationState::Unregistering,
            _ => RegistrationState::Unregistered,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            RegistrationState::Unregistered => 0,
            RegistrationState::Registering => 1,
            RegistrationState::Active => 2,
            RegistrationState::Unregistering => 3,
        }
    }
}

/// One consumer callback bound to one pin
pub struct Registration {
    handle: Handle,
    pin: PinId,
    edge: Edge,
    callback: Arc<dyn EdgeCallback>,
    state: AtomicU8,
    in_flight: Mutex<usize>,
    idle: Condvar,
}

impl Registration {
    fn new(handle: Handle, pin: PinId, edge: Edge, callback: Arc<dyn EdgeCallback>) -> Self {
        Self {
            handle,
            pin,
            edge,
            callback,
            state: AtomicU8::new(RegistrationState::Registering.as_u8()),
            in_flight: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn pin(&self) -> PinId {
        self.pin
    }

    pub fn edge(&self) -> Edge {
        self.edge
    }

    pub fn callback(&self) -> &dyn EdgeCallback {
        self.callback.as_ref()
    }

    pub fn state(&self) -> RegistrationState {
        RegistrationState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: RegistrationState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Number of dispatches currently holding this registration
    pub fn in_flight(&self) -> usize {
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self) {
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn leave(&self) {
        let mut count = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.finish_if_unregistering();
            self.idle.notify_all();
        }
    }

    // Caller holds the in-flight lock with a zero count.
    fn finish_if_unregistering(&self) {
        let _ = self.state.compare_exchange(
            RegistrationState::Unregistering.as_u8(),
            RegistrationState::Unregistered.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Block until no dispatch holds this registration, or `timeout` expires.
    ///
    /// Returns `true` when the registration is quiescent.
    pub fn drain(&self, timeout: Duration) -> bool {
        let count = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let (count, _) = self
            .idle
            .wait_timeout_while(count, timeout, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
        if *count == 0 {
            self.finish_if_unregistering();
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("handle", &self.handle)
            .field("pin", &self.pin)
            .field("edge", &self.edge)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// A successfully resolved registration.
///
/// Counts as one in-flight dispatch until dropped.
pub struct ResolvedRegistration {
    registration: Arc<Registration>,
}

impl Deref for ResolvedRegistration {
    type Target = Registration;

    fn deref(&self) -> &Registration {
        &self.registration
    }
}

impl Drop for ResolvedRegistration {
    fn drop(&mut self) {
        self.registration.leave();
    }
}

impl fmt::Debug for ResolvedRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResolvedRegistration")
            .field(&self.registration)
            .finish()
    }
}

struct RegistryInner {
    entries: HashMap<Handle, Arc<Registration>>,
    by_pin: HashMap<PinId, Handle>,
    /// Last handle issued; allocation resumes after it
    cursor: u32,
}

/// Maps handles to registrations
pub struct CallbackRegistry {
    inner: RwLock<RegistryInner>,
    max_handles: u32,
}

impl CallbackRegistry {
    /// Create a registry using the full handle space
    pub fn new() -> Self {
        Self::with_max_handles(i32::MAX as u32)
    }

    /// Create a registry that issues handles in `1..=max_handles`
    pub fn with_max_handles(max_handles: u32) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                entries: HashMap::new(),
                by_pin: HashMap::new(),
                cursor: 0,
            }),
            max_handles,
        }
    }

    /// Store a new registration in the `Registering` state.
    ///
    /// Fails with `AlreadySubscribed` if the pin already has a registration
    /// and with `ResourceExhausted` once every handle is taken.
    pub fn register(
        &self,
        pin: PinId,
        edge: Edge,
        callback: Arc<dyn EdgeCallback>,
    ) -> Result<Handle> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if inner.by_pin.contains_key(&pin) {
            return Err(BridgeError::AlreadySubscribed(pin));
        }
        if inner.entries.len() as u64 >= u64::from(self.max_handles) {
            return Err(BridgeError::ResourceExhausted(format!(
                "all {} callback handles in use",
                self.max_handles
            )));
        }

        // Terminates: at least one handle in the space is free.
        let mut candidate = inner.cursor;
        let handle = loop {
            candidate = if candidate >= self.max_handles { 1 } else { candidate + 1 };
            let handle = Handle::from_raw(candidate);
            if !inner.entries.contains_key(&handle) {
                break handle;
            }
        };

        inner.cursor = candidate;
        inner
            .entries
            .insert(handle, Arc::new(Registration::new(handle, pin, edge, callback)));
        inner.by_pin.insert(pin, handle);

        log::debug!("Registered {} for GPIO {} ({} edge)", handle, pin, edge);
        Ok(handle)
    }

    /// Move a registration from `Registering` to `Active`
    pub fn activate(&self, handle: Handle) -> Result<()> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let registration = inner
            .entries
            .get(&handle)
            .ok_or(BridgeError::NotFound(handle))?;
        registration.set_state(RegistrationState::Active);
        log::debug!("Activated {}", handle);
        Ok(())
    }

    /// Look up an active registration and count one in-flight dispatch
    pub fn resolve(&self, handle: Handle) -> Result<ResolvedRegistration> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let registration = inner
            .entries
            .get(&handle)
            .filter(|registration| registration.state() == RegistrationState::Active)
            .ok_or(BridgeError::NotFound(handle))?;
        registration.enter();
        Ok(ResolvedRegistration {
            registration: Arc::clone(registration),
        })
    }

    /// Remove a registration.
    ///
    /// No `resolve` succeeds for the handle once this returns. Dispatches
    /// resolved earlier may still be running; use [`Registration::drain`] on
    /// the returned value to wait for them.
    pub fn unregister(&self, handle: Handle) -> Result<Arc<Registration>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let registration = inner
            .entries
            .remove(&handle)
            .ok_or(BridgeError::NotFound(handle))?;
        if inner.by_pin.get(&registration.pin) == Some(&handle) {
            inner.by_pin.remove(&registration.pin);
        }
        drop(inner);

        registration.set_state(RegistrationState::Unregistering);
        {
            let count = registration
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *count == 0 {
                registration.finish_if_unregistering();
            }
        }

        log::debug!("Unregistered {} (GPIO {})", handle, registration.pin);
        Ok(registration)
    }

    /// Undo a `register` whose daemon watch could not be installed.
    ///
    /// Removes the registration and rewinds the allocation cursor when the
    /// handle was the last one issued, so the next `register` behaves as if
    /// the failed call never happened.
    pub fn rollback(&self, handle: Handle) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(registration) = inner.entries.remove(&handle) else {
            return;
        };
        if inner.by_pin.get(&registration.pin) == Some(&handle) {
            inner.by_pin.remove(&registration.pin);
        }
        if inner.cursor == handle.as_raw() {
            inner.cursor = handle.as_raw() - 1;
        }
        registration.set_state(RegistrationState::Unregistered);
        log::debug!("Rolled back {} (GPIO {})", handle, registration.pin);
    }

    /// Whether the handle is currently registered (in any state)
    pub fn contains(&self, handle: Handle) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.entries.contains_key(&handle)
    }

    /// State of a registered handle
    pub fn state(&self, handle: Handle) -> Option<RegistrationState> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.entries.get(&handle).map(|registration| registration.state())
    }

    /// Handle registered for a pin, if any
    pub fn handle_for_pin(&self, pin: PinId) -> Option<Handle> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_pin.get(&pin).copied()
    }

    /// All registered handles, sorted
    pub fn handles(&self) -> Vec<Handle> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut handles: Vec<Handle> = inner.entries.keys().copied().collect();
        handles.sort();
        handles
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unregister everything. Returns the number of registrations removed.
    pub fn teardown(&self) -> usize {
        let handles = self.handles();
        handles
            .into_iter()
            .filter(|handle| self.unregister(*handle).is_ok())
            .count()
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}
