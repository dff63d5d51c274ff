use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use rustc_hash::FxHashMap;

use crate::error::AppError;
use crate::gpio::{GpioBackend, GpioChip, LineMode, LineRequest};

const MOCK_DEFAULT_NUM_LINES: u32 = 54;

/// In-memory chip. Clones share the same simulated hardware.
#[derive(Clone)]
pub struct MockGpioBackend {
    shared: Arc<Shared>,
}

struct Shared {
    num_lines: u32,
    lines: Mutex<FxHashMap<u32, MockLine>>, // keyed by offset
    opens: AtomicUsize,
    closes: AtomicUsize,
    fail_open: AtomicBool,
    fail_read: AtomicBool,
    fail_release: AtomicBool,
    read_gate: Mutex<Option<Arc<Barrier>>>,
}

#[derive(Default)]
struct MockLine {
    consumer: Option<String>,
    level: u8,
    requests: usize,
    mode: Option<LineMode>,
}

impl Default for MockGpioBackend {
    fn default() -> Self {
        Self::new(MOCK_DEFAULT_NUM_LINES)
    }
}

impl MockGpioBackend {
    pub fn new(num_lines: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                num_lines,
                lines: Mutex::new(FxHashMap::default()),
                opens: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                fail_open: AtomicBool::new(false),
                fail_read: AtomicBool::new(false),
                fail_release: AtomicBool::new(false),
                read_gate: Mutex::new(None),
            }),
        }
    }

    /// Marks `offset` as held by a consumer outside this process.
    pub fn claim_external(&self, offset: u32, consumer: &str) {
        if let Ok(mut lines) = self.shared.lines.lock() {
            lines.entry(offset).or_default().consumer = Some(consumer.to_string());
        }
    }

    pub fn set_input_level(&self, offset: u32, level: u8) {
        if let Ok(mut lines) = self.shared.lines.lock() {
            lines.entry(offset).or_default().level = level;
        }
    }

    pub fn line_level(&self, offset: u32) -> Option<u8> {
        let lines = self.shared.lines.lock().ok()?;
        lines.get(&offset).map(|l| l.level)
    }

    /// Mode of the most recent request granted on `offset`.
    pub fn requested_mode(&self, offset: u32) -> Option<LineMode> {
        let lines = self.shared.lines.lock().ok()?;
        lines.get(&offset).and_then(|l| l.mode)
    }

    /// Number of outstanding requests for `offset`.
    pub fn live_requests(&self, offset: u32) -> usize {
        self.shared
            .lines
            .lock()
            .map(|lines| lines.get(&offset).map(|l| l.requests).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn fail_open(&self, fail: bool) {
        self.shared.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn fail_read(&self, fail: bool) {
        self.shared.fail_read.store(fail, Ordering::SeqCst);
    }

    pub fn fail_release(&self, fail: bool) {
        self.shared.fail_release.store(fail, Ordering::SeqCst);
    }

    /// Makes the next value read wait on `gate` twice: once on entry and once
    /// before returning.
    pub fn gate_next_read(&self, gate: Arc<Barrier>) {
        if let Ok(mut slot) = self.shared.read_gate.lock() {
            *slot = Some(gate);
        }
    }
}

impl GpioBackend for MockGpioBackend {
    fn open_chip(&self, name: &str) -> Result<Box<dyn GpioChip>, AppError> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        if self.shared.fail_open.load(Ordering::SeqCst) {
            return Err(AppError::ChipOpen(format!("{name}: no such device")));
        }
        Ok(Box::new(MockChip {
            shared: self.shared.clone(),
        }))
    }
}

struct MockChip {
    shared: Arc<Shared>,
}

impl Drop for MockChip {
    fn drop(&mut self) {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl GpioChip for MockChip {
    fn num_lines(&self) -> u32 {
        self.shared.num_lines
    }

    fn line_consumer(&self, offset: u32) -> Result<Option<String>, AppError> {
        if offset >= self.shared.num_lines {
            return Err(AppError::Gpio(format!("invalid offset {offset}")));
        }
        let lines = self
            .shared
            .lines
            .lock()
            .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?;
        Ok(lines.get(&offset).and_then(|l| l.consumer.clone()))
    }

    fn request_line(
        &self,
        offset: u32,
        mode: LineMode,
        consumer: &str,
    ) -> Result<Box<dyn LineRequest>, AppError> {
        if offset >= self.shared.num_lines {
            return Err(AppError::Gpio(format!("invalid offset {offset}")));
        }
        let mut lines = self
            .shared
            .lines
            .lock()
            .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?;
        let line = lines.entry(offset).or_default();

        if line.consumer.is_some() {
            return Err(AppError::Gpio("device or resource busy".into()));
        }

        line.consumer = Some(consumer.to_string());
        line.requests += 1;
        line.mode = Some(mode);
        if let LineMode::Output { value } = mode {
            line.level = value;
        }

        Ok(Box::new(MockLineRequest {
            offset,
            shared: self.shared.clone(),
            released: false,
        }))
    }
}

struct MockLineRequest {
    offset: u32,
    shared: Arc<Shared>,
    released: bool,
}

impl MockLineRequest {
    fn free_line(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Ok(mut lines) = self.shared.lines.lock()
            && let Some(line) = lines.get_mut(&self.offset)
        {
            line.consumer = None;
            line.requests = line.requests.saturating_sub(1);
        }
    }
}

impl Drop for MockLineRequest {
    fn drop(&mut self) {
        self.free_line();
    }
}

impl LineRequest for MockLineRequest {
    fn value(&self) -> Result<u8, AppError> {
        let gate = self.shared.read_gate.lock().ok().and_then(|mut g| g.take());
        if let Some(gate) = gate {
            gate.wait();
            gate.wait();
        }
        if self.shared.fail_read.load(Ordering::SeqCst) {
            return Err(AppError::Gpio("get value: input/output error".into()));
        }
        let lines = self
            .shared
            .lines
            .lock()
            .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?;
        Ok(lines.get(&self.offset).map(|l| l.level).unwrap_or(0))
    }

    fn release(mut self: Box<Self>) -> Result<(), AppError> {
        // the kernel frees the line even when close reports an error
        self.free_line();
        if self.shared.fail_release.load(Ordering::SeqCst) {
            return Err(AppError::Gpio("close: bad file descriptor".into()));
        }
        Ok(())
    }
}
