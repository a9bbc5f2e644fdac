use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::buffers::{BufferList, DataMeta};
use crate::hal::Device;
use crate::observability::FlowUnitMetrics;

/// Wake-up signal asking the runtime to invoke a flow unit again
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowUnitEvent {
    pub name: String,
}

impl FlowUnitEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

type PrivateValue = Arc<dyn Any + Send + Sync>;

struct ContextShared {
    private: Mutex<HashMap<String, PrivateValue>>,
    output_meta: Mutex<HashMap<String, Arc<DataMeta>>>,
    events: mpsc::UnboundedSender<FlowUnitEvent>,
    statistics: Arc<FlowUnitMetrics>,
}

impl ContextShared {
    fn private<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.private
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()?;
        value.downcast::<T>().ok()
    }

    fn send_event(&self, event: FlowUnitEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

/// Per-stream state handed to every lifecycle call of a flow unit
pub struct DataContext {
    device: Arc<Device>,
    inputs: HashMap<String, BufferList>,
    outputs: HashMap<String, BufferList>,
    input_meta: HashMap<String, Arc<DataMeta>>,
    shared: Arc<ContextShared>,
    events: mpsc::UnboundedReceiver<FlowUnitEvent>,
}

impl DataContext {
    pub fn new(device: Arc<Device>) -> Self {
        Self::with_statistics(device, Arc::new(FlowUnitMetrics::new("stream")))
    }

    pub fn with_statistics(device: Arc<Device>, statistics: Arc<FlowUnitMetrics>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            device,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            input_meta: HashMap::new(),
            shared: Arc::new(ContextShared {
                private: Mutex::new(HashMap::new()),
                output_meta: Mutex::new(HashMap::new()),
                events: sender,
                statistics,
            }),
            events: receiver,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn input(&self, port: &str) -> Option<&BufferList> {
        self.inputs.get(port)
    }

    pub fn set_input(&mut self, port: impl Into<String>, buffers: BufferList) {
        self.inputs.insert(port.into(), buffers);
    }

    /// Output list of `port`, created empty on first use
    pub fn output(&mut self, port: &str) -> &mut BufferList {
        let device = &self.device;
        self.outputs
            .entry(port.to_string())
            .or_insert_with(|| BufferList::new(device.clone()))
    }

    pub fn set_output(&mut self, port: impl Into<String>, buffers: BufferList) {
        self.outputs.insert(port.into(), buffers);
    }

    /// Removes and returns everything written to the outputs so far
    pub fn take_outputs(&mut self) -> HashMap<String, BufferList> {
        std::mem::take(&mut self.outputs)
    }

    pub fn input_meta(&self, port: &str) -> Option<Arc<DataMeta>> {
        self.input_meta.get(port).cloned()
    }

    pub fn set_input_meta(&mut self, port: impl Into<String>, meta: Arc<DataMeta>) {
        self.input_meta.insert(port.into(), meta);
    }

    pub fn output_meta(&self, port: &str) -> Option<Arc<DataMeta>> {
        self.shared.output_meta
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(port)
            .cloned()
    }

    pub fn set_output_meta(&self, port: impl Into<String>, meta: Arc<DataMeta>) {
        self.shared.output_meta
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(port.into(), meta);
    }

    pub fn set_private<T: Any + Send + Sync>(&self, key: impl Into<String>, value: Arc<T>) {
        self.shared.private
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.into(), value);
    }

    /// `None` when the key is missing or holds another type
    pub fn private<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.shared.private(key)
    }

    pub fn send_event(&self, event: FlowUnitEvent) {
        self.shared.send_event(event);
    }

    /// Waits for the next event; `None` on timeout
    pub async fn wait_event(&mut self, timeout: Option<Duration>) -> Option<FlowUnitEvent> {
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.events.recv())
                .await
                .ok()
                .flatten(),
            None => self.events.recv().await,
        }
    }

    pub fn try_event(&mut self) -> Option<FlowUnitEvent> {
        self.events.try_recv().ok()
    }

    pub fn statistics(&self) -> &Arc<FlowUnitMetrics> {
        &self.shared.statistics
    }

    /// Handle for callbacks that must not keep the context alive
    pub fn downgrade(&self) -> WeakContext {
        WeakContext {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

/// Non-owning reference to the shared part of a `DataContext`
#[derive(Clone)]
pub struct WeakContext {
    shared: Weak<ContextShared>,
}

impl WeakContext {
    pub fn is_alive(&self) -> bool {
        self.shared.strong_count() > 0
    }

    pub fn private<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.shared.upgrade()?.private(key)
    }

    pub fn statistics(&self) -> Option<Arc<FlowUnitMetrics>> {
        Some(self.shared.upgrade()?.statistics.clone())
    }

    /// Returns false once the context is gone
    pub fn send_event(&self, event: FlowUnitEvent) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.send_event(event))
    }
}
