//! # DIC DAQ Core Library
//!
//! Signal-synchronized, multi-camera image acquisition for long-running digital image
//! correlation experiments. An external controller (a positioning robot behind a
//! Firmata board) moves samples under the cameras; this crate answers its capture
//! signals, stores the frames and schedules repeated runs with a break in between.
//!
//! ## Crate Structure
//!
//! - **`config`**: `ExperimentConfig`, loaded with figment from TOML plus `DIC_DAQ_`
//!   environment overrides and validated before any hardware is touched.
//! - **`error`**: the `DaqError` enum and the `AppResult` alias.
//! - **`logging`**: `tracing-subscriber` setup (pretty, compact or JSON).
//! - **`hardware`**: capability traits (`DigitalPort`, `FrameSource`), the Firmata
//!   controller transport and mock hardware for simulation and tests.
//! - **`signal`**: pin bookkeeping and edge detection on top of a `DigitalPort`.
//! - **`exposure`**: the per-sample exposure table learned in SetOnce mode and its
//!   CSV cache.
//! - **`capture_log`**: append-only CSV of every saved image.
//! - **`storage`**: per-sample image folders and TIFF output.
//! - **`scheduler`**: runs, the capture handshake and breaks.
//! - **`experiment`**: the lifecycle around the scheduler (start prompt, teardown,
//!   report).
//! - **`report`**: the end-of-experiment report and where it is written.
//! - **`cancel`**: operator cancellation shared by every wait.
//! - **`status`**: the in-place terminal status line.

pub mod cancel;
pub mod capture_log;
pub mod config;
pub mod error;
pub mod experiment;
pub mod exposure;
pub mod hardware;
pub mod logging;
pub mod report;
pub mod scheduler;
pub mod signal;
pub mod status;
pub mod storage;
