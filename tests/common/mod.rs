//! Test doubles shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use streamtrack::backend::RuntimeError;
use streamtrack::error::LoadError;
use streamtrack::{
    BackendKind, DeviceConfig, Event, Frame, ModelHandle, ModelLoader, ModelRuntime, RawDetection, SourcePoll,
    Timestamp,
};

pub const FRAME_SIZE: u32 = 64;

pub fn class_names(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("class-{i}")).collect()
}

/// One person walking right one pixel per frame.
pub struct WalkingPerson {
    classes: Vec<String>,
}

impl WalkingPerson {
    pub fn new(class_count: usize) -> Arc<Self> {
        Arc::new(Self {
            classes: class_names(class_count),
        })
    }
}

impl ModelRuntime for WalkingPerson {
    fn class_names(&self) -> &[String] {
        &self.classes
    }

    fn forward(&self, frame: &Frame) -> Result<Vec<RawDetection>, RuntimeError> {
        let x = (frame.timestamp.as_millis() / 40 % 20) as f32;
        Ok(vec![RawDetection::new([x, 10.0, x + 20.0, 50.0], 0, 0.9)])
    }
}

/// Never answers within any reasonable inference timeout.
pub struct Stalled {
    classes: Vec<String>,
    delay: Duration,
}

impl Stalled {
    pub fn new(class_count: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            classes: class_names(class_count),
            delay,
        })
    }
}

impl ModelRuntime for Stalled {
    fn class_names(&self) -> &[String] {
        &self.classes
    }

    fn forward(&self, _frame: &Frame) -> Result<Vec<RawDetection>, RuntimeError> {
        thread::sleep(self.delay);
        Ok(Vec::new())
    }
}

/// Walks like [`WalkingPerson`], but the first forward pass stalls for
/// `delay`.
pub struct StallOnce {
    walker: Arc<WalkingPerson>,
    delay: Duration,
    stalled: AtomicBool,
}

impl StallOnce {
    pub fn new(class_count: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            walker: WalkingPerson::new(class_count),
            delay,
            stalled: AtomicBool::new(false),
        })
    }
}

impl ModelRuntime for StallOnce {
    fn class_names(&self) -> &[String] {
        self.walker.class_names()
    }

    fn forward(&self, frame: &Frame) -> Result<Vec<RawDetection>, RuntimeError> {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            thread::sleep(self.delay);
        }
        self.walker.forward(frame)
    }
}

/// Fails every forward pass.
pub struct Broken {
    classes: Vec<String>,
}

impl Broken {
    pub fn new(class_count: usize) -> Arc<Self> {
        Arc::new(Self {
            classes: class_names(class_count),
        })
    }
}

impl ModelRuntime for Broken {
    fn class_names(&self) -> &[String] {
        &self.classes
    }

    fn forward(&self, _frame: &Frame) -> Result<Vec<RawDetection>, RuntimeError> {
        Err(RuntimeError::new("device lost"))
    }
}

/// Hands out a runtime per backend kind and records every load.
pub struct MockLoader {
    default: Arc<dyn ModelRuntime>,
    per_kind: HashMap<BackendKind, Arc<dyn ModelRuntime>>,
    failing: Vec<BackendKind>,
    loads: Mutex<Vec<String>>,
}

impl MockLoader {
    pub fn new(default: Arc<dyn ModelRuntime>) -> Self {
        Self {
            default,
            per_kind: HashMap::new(),
            failing: Vec::new(),
            loads: Mutex::new(Vec::new()),
        }
    }

    pub fn with_runtime(mut self, kind: BackendKind, runtime: Arc<dyn ModelRuntime>) -> Self {
        self.per_kind.insert(kind, runtime);
        self
    }

    /// Loading on `kind` fails as if the driver were missing.
    pub fn failing(mut self, kind: BackendKind) -> Self {
        self.failing.push(kind);
        self
    }

    pub fn loads(&self) -> Vec<String> {
        self.loads.lock().unwrap().clone()
    }
}

impl ModelLoader for MockLoader {
    fn load_model(&self, path: &Path, device: &DeviceConfig) -> Result<ModelHandle, LoadError> {
        self.loads.lock().unwrap().push(device.label());
        if self.failing.contains(&device.kind) {
            return Err(LoadError::new(format!("{} driver missing", device.kind)));
        }
        let runtime = self.per_kind.get(&device.kind).unwrap_or(&self.default);
        Ok(ModelHandle::new(path, Arc::clone(runtime)))
    }
}

pub fn frame(source: &str, ts: u64) -> Frame {
    Frame::new(
        source,
        Timestamp(ts),
        FRAME_SIZE,
        FRAME_SIZE,
        1,
        vec![0u8; (FRAME_SIZE * FRAME_SIZE) as usize],
    )
}

/// Plays back `count` frames 40ms apart, then ends the stream.
pub fn finite_source(source: &str, count: u64) -> impl FnMut(Duration) -> SourcePoll + Send + 'static {
    let mut frames: VecDeque<Frame> = (0..count).map(|i| frame(source, i * 40)).collect();
    move |_timeout| match frames.pop_front() {
        Some(frame) => SourcePoll::Frame(frame),
        None => SourcePoll::EndOfStream,
    }
}

/// Live stream: a frame every `period`, timestamps 40ms apart.
pub fn live_source(source: &str, period: Duration) -> impl FnMut(Duration) -> SourcePoll + Send + 'static {
    let source = source.to_string();
    let mut next = 0u64;
    move |_timeout| {
        thread::sleep(period);
        let frame = frame(&source, next * 40);
        next += 1;
        SourcePoll::Frame(frame)
    }
}

/// Connected but silent.
pub fn idle_source() -> impl FnMut(Duration) -> SourcePoll + Send + 'static {
    |timeout: Duration| {
        thread::sleep(timeout.min(Duration::from_millis(20)));
        SourcePoll::Timeout
    }
}

pub fn drain(rx: &crossbeam_channel::Receiver<Event>) -> Vec<Event> {
    rx.try_iter().collect()
}
