use std::sync::{Mutex, PoisonError};

use accelop::config::PluginConfig;
use accelop::device::{DeviceMemory, DevicePtr, ExecutionContext, Stream};
use accelop::primitive::{PermutationCall, PermutationPrimitive, PrimitiveError};
use accelop::spec::OpResult;

/// Context activity observed by [`RecordingContext`], in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEvent {
    Download { bytes: usize },
    Synchronize,
    Permute { output_modes: Vec<i32> },
}

/// Test-only wrapper that forwards to another context and records its use.
pub struct RecordingContext<'a, C> {
    inner: &'a C,
    events: Mutex<Vec<ContextEvent>>,
}

impl<'a, C: ExecutionContext> RecordingContext<'a, C> {
    pub fn new(inner: &'a C) -> Self {
        Self {
            inner,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<ContextEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn record(&self, event: ContextEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl<C: ExecutionContext> Stream for RecordingContext<'_, C> {
    fn download(&self, dst: &mut [u8], src: DevicePtr) -> OpResult<()> {
        self.record(ContextEvent::Download { bytes: dst.len() });
        self.inner.stream().download(dst, src)
    }

    fn synchronize(&self) -> OpResult<()> {
        self.record(ContextEvent::Synchronize);
        self.inner.stream().synchronize()
    }

    fn raw_handle(&self) -> usize {
        self.inner.stream().raw_handle()
    }
}

impl<C: ExecutionContext> PermutationPrimitive for RecordingContext<'_, C> {
    fn name(&self) -> &str {
        self.inner.permutation().name()
    }

    fn permute(&self, call: &PermutationCall<'_>, _stream: &dyn Stream) -> Result<(), PrimitiveError> {
        self.record(ContextEvent::Permute {
            output_modes: call.output_modes.to_vec(),
        });
        self.inner.permutation().permute(call, self.inner.stream())
    }
}

impl<C: ExecutionContext> ExecutionContext for RecordingContext<'_, C> {
    fn stream(&self) -> &dyn Stream {
        self
    }

    fn permutation(&self) -> &dyn PermutationPrimitive {
        self
    }

    fn config(&self) -> &PluginConfig {
        self.inner.config()
    }
}

impl<C: ExecutionContext + DeviceMemory> DeviceMemory for RecordingContext<'_, C> {
    fn alloc(&self, bytes: usize) -> OpResult<DevicePtr> {
        self.inner.alloc(bytes)
    }

    fn write(&self, ptr: DevicePtr, bytes: &[u8]) -> OpResult<()> {
        self.inner.write(ptr, bytes)
    }

    fn read(&self, ptr: DevicePtr) -> OpResult<Vec<u8>> {
        self.inner.read(ptr)
    }

    fn free(&self, ptr: DevicePtr) -> OpResult<()> {
        self.inner.free(ptr)
    }
}
