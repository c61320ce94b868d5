//! Outgoing notifications.
//!
//! Every notification goes two ways: to the host callback registered for it (if any) and
//! onto the broadcast bus as a [`ToolkitEvent`]. Sending on the bus never blocks and
//! silently drops events when nobody is subscribed.
//!
//! Code running under the registry lock must not call into the host, since a host
//! callback may re-enter the toolkit. Such code uses [`EventSink::defer_log`]; the
//! queued lines reach the host on the next [`EventSink::flush_deferred`], which the
//! registry calls once it has released its lock.

use crate::engine::events::{DeviceEventType, LogLevel, ToolkitEvent};
use crate::engine::handle::InstanceHandle;
use crate::engine::instance::InstanceState;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;

pub type LogCallback = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;
pub type NavigationCallback = Arc<dyn Fn(InstanceHandle, &str, bool) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(InstanceHandle, &str) + Send + Sync>;
pub type DeviceEventCallback = Arc<dyn Fn(DeviceEventType) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    log: Option<LogCallback>,
    navigation: Option<NavigationCallback>,
    message: Option<MessageCallback>,
    device: Option<DeviceEventCallback>,
}

pub struct EventSink {
    callbacks: RwLock<Callbacks>,
    deferred: Mutex<Vec<(LogLevel, String)>>,
    event_tx: broadcast::Sender<ToolkitEvent>,
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("subscribers", &self.event_tx.receiver_count())
            .finish()
    }
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            callbacks: RwLock::new(Callbacks::default()),
            deferred: Mutex::new(Vec::new()),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ToolkitEvent> {
        self.event_tx.subscribe()
    }

    pub fn set_log_callback(&self, cb: Option<LogCallback>) {
        self.write().log = cb;
    }

    pub fn set_navigation_callback(&self, cb: Option<NavigationCallback>) {
        self.write().navigation = cb;
    }

    pub fn set_message_callback(&self, cb: Option<MessageCallback>) {
        self.write().message = cb;
    }

    pub fn set_device_event_callback(&self, cb: Option<DeviceEventCallback>) {
        self.write().device = cb;
    }

    /// Logs through the `log` facade and forwards the line to the host.
    pub fn log(&self, level: LogLevel, message: &str) {
        write_log(level, message);
        self.deliver_log(level, message);
    }

    /// Like [`EventSink::log`], but the host only sees the line on the next flush.
    pub fn defer_log(&self, level: LogLevel, message: String) {
        write_log(level, &message);
        self.deferred
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((level, message));
    }

    /// Hands every deferred line to the host. Must not be called with the registry locked.
    pub fn flush_deferred(&self) {
        let pending = std::mem::take(&mut *self.deferred.lock().unwrap_or_else(|e| e.into_inner()));
        for (level, message) in pending {
            self.deliver_log(level, &message);
        }
    }

    fn deliver_log(&self, level: LogLevel, message: &str) {
        if let Some(cb) = self.read().log.clone() {
            cb(level, message);
        }
        self.emit(ToolkitEvent::Log {
            level,
            message: message.to_string(),
        });
    }

    pub fn navigation_completed(&self, handle: InstanceHandle, url: &str, success: bool) {
        if let Some(cb) = self.read().navigation.clone() {
            cb(handle, url, success);
        }
        self.emit(ToolkitEvent::NavigationCompleted {
            handle,
            url: url.to_string(),
            success,
        });
    }

    pub fn message(&self, handle: InstanceHandle, message: &str) {
        if let Some(cb) = self.read().message.clone() {
            cb(handle, message);
        }
        self.emit(ToolkitEvent::MessageReceived {
            handle,
            message: message.to_string(),
        });
    }

    pub fn device_event(&self, event: DeviceEventType) {
        if let Some(cb) = self.read().device.clone() {
            cb(event);
        }
        self.emit(ToolkitEvent::DeviceEvent(event));
    }

    pub fn state_changed(&self, handle: InstanceHandle, state: InstanceState) {
        self.emit(ToolkitEvent::StateChanged { handle, state });
    }

    pub fn emit(&self, event: ToolkitEvent) {
        let _ = self.event_tx.send(event);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Callbacks> {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Callbacks> {
        self.callbacks.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn write_log(level: LogLevel, message: &str) {
    match level {
        LogLevel::Info => log::info!("{message}"),
        LogLevel::Warning => log::warn!("{message}"),
        LogLevel::Error => log::error!("{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callbacks_and_bus_both_receive() {
        let sink = EventSink::new(8);
        let mut rx = sink.subscribe();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        sink.set_navigation_callback(Some(Arc::new(move |h, url: &str, ok| {
            s.lock().unwrap().push((h, url.to_string(), ok));
        })));

        sink.navigation_completed(InstanceHandle::from(3), "about:test", true);
        assert_eq!(
            seen.lock().unwrap()[0],
            (InstanceHandle::from(3), "about:test".to_string(), true)
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ToolkitEvent::NavigationCompleted {
                handle: InstanceHandle::from(3),
                url: "about:test".into(),
                success: true
            }
        );
    }

    #[test]
    fn log_levels_reach_host() {
        let sink = EventSink::new(8);
        let levels = Arc::new(Mutex::new(Vec::new()));
        let l = levels.clone();
        sink.set_log_callback(Some(Arc::new(move |level, _: &str| l.lock().unwrap().push(level))));

        sink.log(LogLevel::Info, "a");
        sink.log(LogLevel::Error, "b");
        sink.set_log_callback(None);
        sink.log(LogLevel::Warning, "c");
        assert_eq!(*levels.lock().unwrap(), vec![LogLevel::Info, LogLevel::Error]);
    }

    #[test]
    fn deferred_lines_wait_for_flush() {
        let sink = EventSink::new(8);
        let mut rx = sink.subscribe();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        sink.set_log_callback(Some(Arc::new(move |_, message: &str| {
            s.lock().unwrap().push(message.to_string())
        })));

        sink.defer_log(LogLevel::Warning, "later".into());
        assert!(seen.lock().unwrap().is_empty());
        assert!(rx.try_recv().is_err());

        sink.flush_deferred();
        sink.flush_deferred();
        assert_eq!(*seen.lock().unwrap(), vec!["later".to_string()]);
        assert_eq!(
            rx.try_recv().unwrap(),
            ToolkitEvent::Log {
                level: LogLevel::Warning,
                message: "later".into()
            }
        );
    }

    #[test]
    fn no_subscribers_is_fine() {
        let sink = EventSink::new(1);
        sink.device_event(DeviceEventType::Lost);
        sink.message(InstanceHandle::from(1), "hello");
    }
}
