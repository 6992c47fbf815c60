//! Device connectivity monitor.
//!
//! Wraps the SDK's hot-plug listener registration behind three independent
//! observer slots (connected, disconnected, state changed). Observers run on
//! the SDK's event thread. `unsubscribe` closes the slots before removing the
//! listener, so no observer is entered after it returns.

use std::sync::Arc;

use crate::gate::CallbackSlot;
use crate::sdk::{
    ConnectivityListener, DeviceInfo, DeviceState, ListenerId, SdkError, SensorSdk,
};

/// One connectivity transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Connected(DeviceInfo),
    Disconnected(DeviceInfo),
    StateChanged(DeviceInfo, DeviceState),
}

impl ConnectivityEvent {
    pub fn device(&self) -> &DeviceInfo {
        match self {
            ConnectivityEvent::Connected(info)
            | ConnectivityEvent::Disconnected(info)
            | ConnectivityEvent::StateChanged(info, _) => info,
        }
    }

    /// Route the event to the matching listener method.
    pub fn dispatch(&self, listener: &dyn ConnectivityListener) {
        match self {
            ConnectivityEvent::Connected(info) => listener.on_device_connected(info),
            ConnectivityEvent::Disconnected(info) => listener.on_device_disconnected(info),
            ConnectivityEvent::StateChanged(info, state) => {
                listener.on_device_state_changed(info, *state)
            }
        }
    }
}

type DeviceObserver = dyn FnMut(&DeviceInfo) + Send;
type StateObserver = dyn FnMut(&DeviceInfo, DeviceState) + Send;

struct ObserverSet {
    connected: CallbackSlot<DeviceObserver>,
    disconnected: CallbackSlot<DeviceObserver>,
    state_changed: CallbackSlot<StateObserver>,
}

impl ObserverSet {
    fn close(&self) {
        self.connected.close();
        self.disconnected.close();
        self.state_changed.close();
    }
}

impl ConnectivityListener for ObserverSet {
    fn on_device_connected(&self, info: &DeviceInfo) {
        self.connected.invoke(|observer| observer(info));
    }

    fn on_device_disconnected(&self, info: &DeviceInfo) {
        self.disconnected.invoke(|observer| observer(info));
    }

    fn on_device_state_changed(&self, info: &DeviceInfo, state: DeviceState) {
        self.state_changed.invoke(|observer| observer(info, state));
    }
}

struct Subscription {
    id: ListenerId,
    observers: Arc<ObserverSet>,
}

/// Enumerates devices and forwards hot-plug events to observers.
pub struct DeviceConnectivityMonitor {
    sdk: Arc<dyn SensorSdk>,
    subscription: Option<Subscription>,
}

impl DeviceConnectivityMonitor {
    pub fn new(sdk: Arc<dyn SensorSdk>) -> Self {
        Self {
            sdk,
            subscription: None,
        }
    }

    /// Devices connected at call time. Call again for a fresh snapshot.
    pub fn enumerate(&self) -> Result<Vec<DeviceInfo>, SdkError> {
        self.sdk.enumerate_devices()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Register the three observers, replacing any previous subscription.
    pub fn subscribe<C, D, S>(
        &mut self,
        on_connected: C,
        on_disconnected: D,
        on_state_changed: S,
    ) -> Result<(), SdkError>
    where
        C: FnMut(&DeviceInfo) + Send + 'static,
        D: FnMut(&DeviceInfo) + Send + 'static,
        S: FnMut(&DeviceInfo, DeviceState) + Send + 'static,
    {
        self.unsubscribe();

        let connected: Box<DeviceObserver> = Box::new(on_connected);
        let disconnected: Box<DeviceObserver> = Box::new(on_disconnected);
        let state_changed: Box<StateObserver> = Box::new(on_state_changed);
        let observers = Arc::new(ObserverSet {
            connected: CallbackSlot::new(connected),
            disconnected: CallbackSlot::new(disconnected),
            state_changed: CallbackSlot::new(state_changed),
        });
        let listener: Arc<dyn ConnectivityListener> = observers.clone();
        let id = self.sdk.add_connectivity_listener(listener)?;
        log::debug!("connectivity observers registered ({:?})", id);
        self.subscription = Some(Subscription { id, observers });
        Ok(())
    }

    /// Remove all observers. Safe to call when not subscribed.
    pub fn unsubscribe(&mut self) {
        let Some(subscription) = self.subscription.take() else {
            return;
        };
        subscription.observers.close();
        self.sdk.remove_connectivity_listener(subscription.id);
        log::debug!("connectivity observers removed ({:?})", subscription.id);
    }
}

impl Drop for DeviceConnectivityMonitor {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
