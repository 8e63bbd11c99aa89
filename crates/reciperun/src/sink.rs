//! Output delivery.

use std::collections::BTreeMap;
use std::sync::Arc;

/// Receives each output tensor once per run.
///
/// The buffer is shared; cloning the `Arc` is how a sink retains it past the callback.
pub trait OutputSink {
    fn on_output(&mut self, name: &str, buffer: &Arc<[u8]>);
}

impl<F> OutputSink for F
where
    F: FnMut(&str, &Arc<[u8]>),
{
    fn on_output(&mut self, name: &str, buffer: &Arc<[u8]>) {
        self(name, buffer)
    }
}

/// Sink that retains every output by tensor name.
#[derive(Debug, Clone, Default)]
pub struct DataCollector {
    buffers: BTreeMap<String, Arc<[u8]>>,
}

impl DataCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<[u8]>> {
        self.buffers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.buffers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

impl OutputSink for DataCollector {
    fn on_output(&mut self, name: &str, buffer: &Arc<[u8]>) {
        self.buffers.insert(name.to_string(), Arc::clone(buffer));
    }
}
