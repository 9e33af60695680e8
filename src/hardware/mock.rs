//! Mock Hardware Implementations
//!
//! Simulated devices for `--simulate` runs and for tests without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockDigitalPort` - Controller pins with scriptable inputs and recorded outputs
//! - `SimulatedController` - Task playing the positioning-robot side of the handshake
//! - `MockFrameSource` - N cameras with a background acquisition task
//!
//! # Performance Characteristics
//!
//! - MockDigitalPort: writes yield once, like a real bus write
//! - MockFrameSource: one frame per camera every 50ms by default

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::config::{InputPins, OutputPins};
use crate::hardware::capabilities::{AutoExposure, DigitalPort, FrameSource};
use crate::hardware::{CameraFrame, Frame};

// =============================================================================
// MockDigitalPort - Simulated controller pins
// =============================================================================

#[derive(Debug, Default)]
struct PortState {
    input_pins: HashSet<u8>,
    output_pins: HashSet<u8>,
    input_levels: HashMap<u8, bool>,
    output_levels: HashMap<u8, bool>,
    writes: Vec<(u8, bool)>,
}

/// Mock controller port
///
/// Input levels are set by the test (or [`SimulatedController`]); output writes are
/// recorded so tests can assert the handshake and the final pin state.
///
/// # Example
///
/// ```rust,ignore
/// let port = MockDigitalPort::new();
/// port.configure_input(6).await?;
/// port.set_input(6, true);
/// assert_eq!(port.read(6).await?, Some(true));
/// ```
pub struct MockDigitalPort {
    state: Mutex<PortState>,
    connected: AtomicBool,
    closed: AtomicBool,
    fail_reads: AtomicBool,
    generation: watch::Sender<u64>,
}

impl MockDigitalPort {
    /// Connected port with no pins configured.
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            state: Mutex::new(PortState::default()),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            generation,
        }
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    /// Drive an input pin from the device side.
    pub fn set_input(&self, pin: u8, level: bool) {
        self.state.lock().input_levels.insert(pin, level);
        self.bump();
    }

    /// Last level written to an output pin.
    pub fn output(&self, pin: u8) -> Option<bool> {
        self.state.lock().output_levels.get(&pin).copied()
    }

    /// Every write in order.
    pub fn writes(&self) -> Vec<(u8, bool)> {
        self.state.lock().writes.clone()
    }

    /// Number of writes of `level` to `pin`.
    pub fn write_count(&self, pin: u8, level: bool) -> usize {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|&&w| w == (pin, level))
            .count()
    }

    /// Wait until output `pin` holds `level`.
    pub async fn wait_for_output(&self, pin: u8, level: bool) {
        let mut rx = self.generation.subscribe();
        loop {
            if self.output(pin) == Some(level) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Simulate the USB link dropping.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.bump();
    }

    /// Restore the link.
    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.bump();
    }

    /// Make every read fail with an I/O error.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for MockDigitalPort {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DigitalPort for MockDigitalPort {
    async fn configure_input(&self, pin: u8) -> Result<()> {
        if !self.is_connected() {
            anyhow::bail!("MockDigitalPort: disconnected");
        }
        let mut state = self.state.lock();
        state.output_pins.remove(&pin);
        state.input_pins.insert(pin);
        Ok(())
    }

    async fn configure_output(&self, pin: u8) -> Result<()> {
        if !self.is_connected() {
            anyhow::bail!("MockDigitalPort: disconnected");
        }
        let mut state = self.state.lock();
        state.input_pins.remove(&pin);
        state.output_pins.insert(pin);
        Ok(())
    }

    async fn read(&self, pin: u8) -> Result<Option<bool>> {
        if !self.is_connected() {
            anyhow::bail!("MockDigitalPort: disconnected");
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            anyhow::bail!("MockDigitalPort: read failure on pin {pin}");
        }
        let state = self.state.lock();
        if !state.input_pins.contains(&pin) {
            anyhow::bail!("MockDigitalPort: pin {pin} is not an input");
        }
        Ok(state.input_levels.get(&pin).copied())
    }

    async fn write(&self, pin: u8, level: bool) -> Result<()> {
        if !self.is_connected() {
            anyhow::bail!("MockDigitalPort: disconnected");
        }
        {
            let mut state = self.state.lock();
            if !state.output_pins.contains(&pin) {
                anyhow::bail!("MockDigitalPort: pin {pin} is not an output");
            }
            state.output_levels.insert(pin, level);
            state.writes.push((pin, level));
        }
        self.bump();
        tokio::task::yield_now().await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.bump();
        Ok(())
    }

    fn describe(&self) -> String {
        "mock controller".to_string()
    }
}

// =============================================================================
// SimulatedController - Positioning robot
// =============================================================================

/// Plays the robot side of the run protocol against a [`MockDigitalPort`]:
///
/// 1. wait for `DI_RUN` HIGH
/// 2. per sample: move, pulse `DO_CAPTURE`, wait for the `DI_CAPTURE_COMPLETE` pulse
/// 3. raise `DO_RUN_COMPLETE` and hold it until `DI_RUN` goes LOW
///
/// Extra capture pulses (beyond the sample count) are sent without waiting for an
/// acknowledgement, since none will come.
pub struct SimulatedController {
    port: Arc<MockDigitalPort>,
    inputs: InputPins,
    outputs: OutputPins,
    num_samples: usize,
    extra_captures: usize,
    move_delay: Duration,
    pulse: Duration,
    max_runs: Option<usize>,
}

impl SimulatedController {
    /// Robot serving `num_samples` samples per run on `port`.
    pub fn new(
        port: Arc<MockDigitalPort>,
        inputs: InputPins,
        outputs: OutputPins,
        num_samples: usize,
    ) -> Self {
        Self {
            port,
            inputs,
            outputs,
            num_samples,
            extra_captures: 0,
            move_delay: Duration::from_millis(200),
            pulse: Duration::from_millis(50),
            max_runs: None,
        }
    }

    /// Send `n` capture pulses after the last sample.
    pub fn with_extra_captures(mut self, n: usize) -> Self {
        self.extra_captures = n;
        self
    }

    /// Time spent moving between samples.
    pub fn with_move_delay(mut self, delay: Duration) -> Self {
        self.move_delay = delay;
        self
    }

    /// Width of the capture pulse. Must exceed the scheduler poll tick.
    pub fn with_pulse(mut self, pulse: Duration) -> Self {
        self.pulse = pulse;
        self
    }

    /// Stop after this many runs.
    pub fn with_max_runs(mut self, runs: usize) -> Self {
        self.max_runs = Some(runs);
        self
    }

    /// Start the robot task; it returns the number of completed runs.
    pub fn spawn(self) -> JoinHandle<usize> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) -> usize {
        let port = &self.port;
        let capture = self.inputs.do_capture;
        let run_complete = self.inputs.do_run_complete;
        let ack = self.outputs.di_capture_complete;

        port.set_input(capture, false);
        port.set_input(run_complete, false);

        let mut runs = 0;
        loop {
            port.wait_for_output(self.outputs.di_run, true).await;
            port.set_input(run_complete, false);
            tracing::debug!(run = runs, "SimulatedController: run started");

            for i in 0..self.num_samples + self.extra_captures {
                sleep(self.move_delay).await;
                port.set_input(capture, true);
                sleep(self.pulse).await;
                port.set_input(capture, false);
                if i < self.num_samples {
                    port.wait_for_output(ack, true).await;
                    port.wait_for_output(ack, false).await;
                } else {
                    sleep(self.pulse).await;
                }
            }

            sleep(self.move_delay).await;
            port.set_input(run_complete, true);
            port.wait_for_output(self.outputs.di_run, false).await;
            port.set_input(run_complete, false);
            runs += 1;
            tracing::debug!(runs, "SimulatedController: run complete");

            if self.max_runs.is_some_and(|max| runs >= max) {
                return runs;
            }
        }
    }
}

// =============================================================================
// MockFrameSource - Simulated camera rig
// =============================================================================

#[derive(Debug, Default)]
struct RigState {
    open: usize,
    acquiring: bool,
    latest: Vec<Option<Frame>>,
    stalled: HashSet<usize>,
    exposures: Vec<f64>,
    auto: Option<AutoExposure>,
}

/// Mock camera rig
///
/// Simulates N cameras with:
/// - A background acquisition task writing the latest frame per camera
/// - Grabs that copy the latest frames and wait at most the grab timeout
/// - Scripted auto-exposure results (one value per `set_auto_exposure` call)
/// - Counters and failure switches for tests
///
/// # Example
///
/// ```rust,ignore
/// let rig = MockFrameSource::new(2, 64, 48).with_auto_exposures(vec![1200.0]);
/// rig.initialize().await?;
/// rig.start_acquisition().await?;
/// let frames = rig.grab_frames().await?;
/// assert_eq!(frames.len(), 2);
/// ```
pub struct MockFrameSource {
    cameras: usize,
    resolution: (u32, u32),
    grab_timeout: Duration,
    frame_period: Duration,
    default_auto_exposure: f64,
    state: Arc<Mutex<RigState>>,
    acquisition: Mutex<Option<JoinHandle<()>>>,
    auto_script: Mutex<VecDeque<f64>>,
    manual_history: Mutex<Vec<f64>>,
    auto_calls: AtomicUsize,
    init_count: AtomicUsize,
    close_count: AtomicUsize,
    fail_grabs: AtomicBool,
    fail_exposure: AtomicBool,
}

impl MockFrameSource {
    /// `cameras` simulated cameras with the given resolution.
    pub fn new(cameras: usize, width: u32, height: u32) -> Self {
        Self {
            cameras,
            resolution: (width, height),
            grab_timeout: Duration::from_millis(5000),
            frame_period: Duration::from_millis(50),
            default_auto_exposure: 5000.0,
            state: Arc::new(Mutex::new(RigState::default())),
            acquisition: Mutex::new(None),
            auto_script: Mutex::new(VecDeque::new()),
            manual_history: Mutex::new(Vec::new()),
            auto_calls: AtomicUsize::new(0),
            init_count: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
            fail_grabs: AtomicBool::new(false),
            fail_exposure: AtomicBool::new(false),
        }
    }

    /// Longest a grab waits for each camera.
    pub fn with_grab_timeout(mut self, timeout: Duration) -> Self {
        self.grab_timeout = timeout;
        self
    }

    /// Time between frames of the acquisition task.
    pub fn with_frame_period(mut self, period: Duration) -> Self {
        self.frame_period = period;
        self
    }

    /// Values returned by successive auto-exposure passes.
    pub fn with_auto_exposures(self, values: Vec<f64>) -> Self {
        *self.auto_script.lock() = values.into();
        self
    }

    /// Value returned once the script is exhausted.
    pub fn with_default_auto_exposure(mut self, value: f64) -> Self {
        self.default_auto_exposure = value;
        self
    }

    /// Auto-exposure passes requested so far
    pub fn auto_exposure_calls(&self) -> usize {
        self.auto_calls.load(Ordering::SeqCst)
    }

    /// Every manual exposure applied, in order
    pub fn manual_exposures(&self) -> Vec<f64> {
        self.manual_history.lock().clone()
    }

    /// Calls to `initialize`
    pub fn init_count(&self) -> usize {
        self.init_count.load(Ordering::SeqCst)
    }

    /// Closes of an open rig
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Whether the acquisition task is running
    pub fn is_acquiring(&self) -> bool {
        self.state.lock().acquiring
    }

    /// Make every grab fail.
    pub fn set_fail_grabs(&self, fail: bool) {
        self.fail_grabs.store(fail, Ordering::SeqCst);
    }

    /// Make every exposure change fail.
    pub fn set_fail_exposure(&self, fail: bool) {
        self.fail_exposure.store(fail, Ordering::SeqCst);
    }

    /// Stop `camera` from delivering frames; its grabs time out until
    /// [`Self::resume_camera`].
    pub fn stall_camera(&self, camera: usize) {
        let mut state = self.state.lock();
        state.stalled.insert(camera);
        if let Some(slot) = state.latest.get_mut(camera) {
            *slot = None;
        }
    }

    /// Let a stalled camera deliver frames again.
    pub fn resume_camera(&self, camera: usize) {
        self.state.lock().stalled.remove(&camera);
    }

    fn stop_task(&self) {
        let task = self.acquisition.lock().take();
        if let Some(task) = task {
            task.abort();
        }
    }

    fn snapshot(&self, camera: usize) -> Option<Frame> {
        self.state.lock().latest.get(camera).cloned().flatten()
    }
}

fn test_pattern(width: u32, height: u32, camera: usize, frame_num: u64) -> Frame {
    let offset = (frame_num as u32).wrapping_mul(7).wrapping_add(camera as u32 * 1000);
    let pixels: Vec<u16> = (0..width * height)
        .map(|i| (i.wrapping_add(offset) % 4096) as u16)
        .collect();
    Frame::from_u16(width, height, &pixels)
}

#[async_trait]
impl FrameSource for MockFrameSource {
    async fn initialize(&self) -> Result<usize> {
        let mut state = self.state.lock();
        state.open = self.cameras;
        state.latest = vec![None; self.cameras];
        if state.exposures.len() != self.cameras {
            state.exposures = vec![self.default_auto_exposure; self.cameras];
        }
        self.init_count.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(cameras = self.cameras, "MockFrameSource: initialized");
        Ok(self.cameras)
    }

    async fn start_acquisition(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.open == 0 {
                anyhow::bail!("MockFrameSource: no cameras open");
            }
            if state.acquiring {
                return Ok(());
            }
            state.acquiring = true;
        }

        let state = Arc::clone(&self.state);
        let (width, height) = self.resolution;
        let cameras = self.cameras;
        let period = self.frame_period;

        let task = tokio::spawn(async move {
            let mut frame_num = 0u64;
            loop {
                // Render outside the lock, publish inside it.
                let frames: Vec<Frame> = (0..cameras)
                    .map(|cam| test_pattern(width, height, cam, frame_num))
                    .collect();
                {
                    let mut state = state.lock();
                    if !state.acquiring {
                        break;
                    }
                    let RigState { latest, stalled, .. } = &mut *state;
                    for (cam, (slot, frame)) in latest.iter_mut().zip(frames).enumerate() {
                        if !stalled.contains(&cam) {
                            *slot = Some(frame);
                        }
                    }
                }
                frame_num += 1;
                sleep(period).await;
            }
        });
        *self.acquisition.lock() = Some(task);
        tracing::debug!("MockFrameSource: acquisition started");
        Ok(())
    }

    async fn grab_frames(&self) -> Result<Vec<CameraFrame>> {
        if self.fail_grabs.load(Ordering::SeqCst) {
            return Err(anyhow!("MockFrameSource: grab failed"));
        }
        if !self.state.lock().acquiring {
            return Err(anyhow!("MockFrameSource: cameras are not grabbing"));
        }

        let mut frames = Vec::with_capacity(self.cameras);
        for camera in 0..self.cameras {
            let poll = self.frame_period / 4;
            let waited = tokio::time::timeout(self.grab_timeout, async {
                loop {
                    if let Some(frame) = self.snapshot(camera) {
                        return frame;
                    }
                    sleep(poll).await;
                }
            })
            .await;
            match waited {
                Ok(frame) => frames.push(CameraFrame::new(camera, frame)),
                Err(_) => tracing::error!(camera, "MockFrameSource: grab timed out"),
            }
        }
        Ok(frames)
    }

    async fn set_manual_exposure(&self, exposure_us: f64) -> Result<()> {
        if self.fail_exposure.load(Ordering::SeqCst) {
            anyhow::bail!("MockFrameSource: exposure rejected");
        }
        if !(exposure_us.is_finite() && exposure_us > 0.0) {
            anyhow::bail!("MockFrameSource: exposure must be positive, got {exposure_us}");
        }
        {
            let mut state = self.state.lock();
            state.auto = None;
            state.exposures.iter_mut().for_each(|e| *e = exposure_us);
        }
        self.manual_history.lock().push(exposure_us);
        Ok(())
    }

    async fn set_auto_exposure(&self, mode: AutoExposure) -> Result<f64> {
        self.auto_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_exposure.load(Ordering::SeqCst) {
            anyhow::bail!("MockFrameSource: auto-exposure failed");
        }
        let value = self
            .auto_script
            .lock()
            .pop_front()
            .unwrap_or(self.default_auto_exposure);
        let mut state = self.state.lock();
        state.auto = Some(mode);
        state.exposures.iter_mut().for_each(|e| *e = value);
        Ok(value)
    }

    async fn exposures(&self) -> Vec<Option<f64>> {
        let state = self.state.lock();
        if state.open == 0 {
            return vec![None; self.cameras];
        }
        state.exposures.iter().copied().map(Some).collect()
    }

    fn camera_count(&self) -> usize {
        self.state.lock().open
    }

    async fn close(&self) -> Result<()> {
        self.stop_task();
        let mut state = self.state.lock();
        let was_open = state.open > 0;
        state.open = 0;
        state.acquiring = false;
        state.latest.clear();
        drop(state);
        if was_open {
            self.close_count.fetch_add(1, Ordering::SeqCst);
            tracing::debug!("MockFrameSource: closed");
        }
        Ok(())
    }
}

impl Drop for MockFrameSource {
    fn drop(&mut self) {
        self.stop_task();
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pins() -> (InputPins, OutputPins) {
        (
            InputPins {
                do_capture: 6,
                do_run_complete: 7,
            },
            OutputPins {
                di_run: 2,
                di_capture_complete: 3,
            },
        )
    }

    #[tokio::test]
    async fn test_mock_port_requires_configuration() {
        let port = MockDigitalPort::new();
        assert!(port.read(6).await.is_err());
        assert!(port.write(2, true).await.is_err());

        port.configure_input(6).await.unwrap();
        port.configure_output(2).await.unwrap();
        assert_eq!(port.read(6).await.unwrap(), None);
        port.set_input(6, true);
        assert_eq!(port.read(6).await.unwrap(), Some(true));

        port.write(2, true).await.unwrap();
        port.write(2, false).await.unwrap();
        assert_eq!(port.output(2), Some(false));
        assert_eq!(port.writes(), vec![(2, true), (2, false)]);
        assert_eq!(port.write_count(2, true), 1);
    }

    #[tokio::test]
    async fn test_mock_port_disconnect() {
        let port = MockDigitalPort::new();
        port.configure_input(6).await.unwrap();
        port.disconnect();
        assert!(!port.is_connected());
        assert!(port.read(6).await.is_err());
        port.reconnect();
        assert!(port.read(6).await.is_ok());
        port.close().await.unwrap();
        assert!(!port.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_controller_handshake() {
        let port = Arc::new(MockDigitalPort::new());
        let (inputs, outputs) = pins();
        for pin in [inputs.do_capture, inputs.do_run_complete] {
            port.configure_input(pin).await.unwrap();
        }
        for pin in [outputs.di_run, outputs.di_capture_complete] {
            port.configure_output(pin).await.unwrap();
            port.write(pin, false).await.unwrap();
        }

        let robot = SimulatedController::new(Arc::clone(&port), inputs, outputs, 1)
            .with_pulse(Duration::from_millis(30))
            .with_max_runs(1)
            .spawn();

        port.write(outputs.di_run, true).await.unwrap();

        // Wait for the capture pulse, then acknowledge it.
        while port.read(inputs.do_capture).await.unwrap() != Some(true) {
            sleep(Duration::from_millis(10)).await;
        }
        port.write(outputs.di_capture_complete, true).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        port.write(outputs.di_capture_complete, false).await.unwrap();

        while port.read(inputs.do_run_complete).await.unwrap() != Some(true) {
            sleep(Duration::from_millis(10)).await;
        }
        port.write(outputs.di_run, false).await.unwrap();

        assert_eq!(robot.await.unwrap(), 1);
        assert_eq!(port.read(inputs.do_run_complete).await.unwrap(), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_rig_grab_and_exposure() {
        let rig = MockFrameSource::new(2, 8, 4).with_auto_exposures(vec![1200.0, 800.0]);
        assert!(rig.start_acquisition().await.is_err());

        assert_eq!(rig.initialize().await.unwrap(), 2);
        rig.start_acquisition().await.unwrap();

        let frames = rig.grab_frames().await.unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].camera, 1);
        assert_eq!(frames[0].frame.width, 8);
        assert_eq!(frames[0].frame.data.len(), frames[0].frame.expected_len());

        assert_eq!(rig.set_auto_exposure(AutoExposure::Once).await.unwrap(), 1200.0);
        assert_eq!(rig.exposures().await, vec![Some(1200.0), Some(1200.0)]);
        assert_eq!(rig.set_auto_exposure(AutoExposure::Once).await.unwrap(), 800.0);
        assert_eq!(rig.set_auto_exposure(AutoExposure::Once).await.unwrap(), 5000.0);
        assert_eq!(rig.auto_exposure_calls(), 3);

        rig.set_manual_exposure(2500.0).await.unwrap();
        assert_eq!(rig.manual_exposures(), vec![2500.0]);
        assert!(rig.set_manual_exposure(-1.0).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_camera_keeps_camera_indices() {
        let rig = MockFrameSource::new(3, 4, 4)
            .with_frame_period(Duration::from_millis(20))
            .with_grab_timeout(Duration::from_millis(200));
        rig.initialize().await.unwrap();
        rig.start_acquisition().await.unwrap();
        rig.stall_camera(0);

        let started = tokio::time::Instant::now();
        let frames = rig.grab_frames().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        let cameras: Vec<usize> = frames.iter().map(|f| f.camera).collect();
        assert_eq!(cameras, vec![1, 2]);

        rig.resume_camera(0);
        sleep(Duration::from_millis(40)).await;
        assert_eq!(rig.grab_frames().await.unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_auto_exposure_after_script() {
        let rig = MockFrameSource::new(1, 4, 4)
            .with_auto_exposures(vec![700.0])
            .with_default_auto_exposure(1500.0);
        rig.initialize().await.unwrap();
        assert_eq!(rig.set_auto_exposure(AutoExposure::Once).await.unwrap(), 700.0);
        assert_eq!(rig.set_auto_exposure(AutoExposure::Once).await.unwrap(), 1500.0);
        assert_eq!(rig.exposures().await, vec![Some(1500.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_rig_close_is_idempotent() {
        let rig = MockFrameSource::new(1, 4, 4);
        rig.initialize().await.unwrap();
        rig.start_acquisition().await.unwrap();
        rig.close().await.unwrap();
        rig.close().await.unwrap();
        assert_eq!(rig.close_count(), 1);
        assert_eq!(rig.camera_count(), 0);
        assert!(rig.grab_frames().await.is_err());
        assert_eq!(rig.exposures().await, vec![None]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_rig_failures() {
        let rig = MockFrameSource::new(1, 4, 4);
        rig.initialize().await.unwrap();
        rig.start_acquisition().await.unwrap();

        rig.set_fail_grabs(true);
        assert!(rig.grab_frames().await.is_err());
        rig.set_fail_grabs(false);
        assert_eq!(rig.grab_frames().await.unwrap().len(), 1);

        rig.set_fail_exposure(true);
        assert!(rig.set_auto_exposure(AutoExposure::Once).await.is_err());
        assert!(rig.set_manual_exposure(100.0).await.is_err());
        assert_eq!(rig.auto_exposure_calls(), 1);
    }
}
