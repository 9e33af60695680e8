//! Firmata controller transport
//!
//! Speaks the StandardFirmata protocol to the microcontroller that drives the
//! positioning robot. Only the digital subset is used:
//!
//! | Message          | Bytes                                  |
//! |------------------|----------------------------------------|
//! | SET_PIN_MODE     | `0xF4 pin mode`                        |
//! | REPORT_DIGITAL   | `0xD0\|port enable`                    |
//! | DIGITAL_MESSAGE  | `0x90\|port lsb(bits 0-6) msb(bit 7)`  |
//!
//! Incoming analog, version and sysex messages are parsed so the stream stays
//! aligned, then ignored (the version is kept for [`DigitalPort::describe`]).
//!
//! A background reader task owns the read half and keeps the latest level of
//! every reported port. EOF or an I/O error marks the board disconnected.
//!
//! # Example
//! ```no_run
//! # async fn example() -> dic_daq::error::AppResult<()> {
//! use dic_daq::config::ExperimentConfig;
//! use dic_daq::hardware::firmata;
//!
//! let config = ExperimentConfig::load_from("config/experiment.toml")?;
//! let board = firmata::connect(&config.controller).await?;
//! # Ok(())
//! # }
//! ```

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::task::JoinHandle;

use crate::config::ControllerConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::DigitalPort;

/// Digital I/O message (`0x90 | port`)
pub const DIGITAL_MESSAGE: u8 = 0x90;
/// Analog I/O message (`0xE0 | pin`)
pub const ANALOG_MESSAGE: u8 = 0xE0;
/// Enable/disable digital reporting (`0xD0 | port`)
pub const REPORT_DIGITAL: u8 = 0xD0;
/// Set pin mode
pub const SET_PIN_MODE: u8 = 0xF4;
/// Protocol version report
pub const REPORT_VERSION: u8 = 0xF9;
/// Start of sysex block
pub const START_SYSEX: u8 = 0xF0;
/// End of sysex block
pub const END_SYSEX: u8 = 0xF7;

/// Pin mode: digital input
pub const MODE_INPUT: u8 = 0x00;
/// Pin mode: digital output
pub const MODE_OUTPUT: u8 = 0x01;

/// Number of 8-pin ports addressable by a digital message
const NUM_PORTS: usize = 16;

/// Encode `SET_PIN_MODE`.
pub fn encode_set_pin_mode(pin: u8, mode: u8) -> [u8; 3] {
    [SET_PIN_MODE, pin & 0x7F, mode & 0x7F]
}

/// Encode `REPORT_DIGITAL` for the port containing a pin.
pub fn encode_report_digital(port: u8, enable: bool) -> [u8; 2] {
    [REPORT_DIGITAL | (port & 0x0F), u8::from(enable)]
}

/// Encode a `DIGITAL_MESSAGE` carrying the full 8-bit level mask of `port`.
pub fn encode_digital_message(port: u8, mask: u8) -> [u8; 3] {
    [DIGITAL_MESSAGE | (port & 0x0F), mask & 0x7F, mask >> 7]
}

/// Decoded incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmataMessage {
    /// Level mask of an 8-pin port
    Digital {
        /// Port number (pins `8 * port .. 8 * port + 8`)
        port: u8,
        /// Bit `n` is the level of pin `8 * port + n`
        mask: u8,
    },
    /// 14-bit analog sample
    Analog {
        /// Analog channel
        pin: u8,
        /// Sample value
        value: u16,
    },
    /// Firmware protocol version
    Version {
        /// Major version
        major: u8,
        /// Minor version
        minor: u8,
    },
    /// Sysex payload (without start/end bytes)
    Sysex(Vec<u8>),
}

#[derive(Debug, Default)]
enum ParseState {
    #[default]
    Idle,
    Command {
        command: u8,
        data: [u8; 2],
        filled: usize,
    },
    Sysex(Vec<u8>),
}

/// Incremental parser. Feed bytes as they arrive; partial messages are kept.
#[derive(Debug, Default)]
pub struct FirmataParser {
    state: ParseState,
}

impl FirmataParser {
    /// Parser waiting for a command byte.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push one byte; returns a message when one completes.
    pub fn push(&mut self, byte: u8) -> Option<FirmataMessage> {
        if let ParseState::Sysex(payload) = &mut self.state {
            if byte == END_SYSEX {
                let payload = std::mem::take(payload);
                self.state = ParseState::Idle;
                return Some(FirmataMessage::Sysex(payload));
            }
            if byte & 0x80 == 0 {
                payload.push(byte);
                return None;
            }
            // A command byte inside sysex aborts the block.
            self.state = ParseState::Idle;
        }

        if byte & 0x80 != 0 {
            self.state = match byte {
                START_SYSEX => ParseState::Sysex(Vec::new()),
                REPORT_VERSION => ParseState::Command {
                    command: byte,
                    data: [0; 2],
                    filled: 0,
                },
                b if b & 0xF0 == DIGITAL_MESSAGE || b & 0xF0 == ANALOG_MESSAGE => {
                    ParseState::Command {
                        command: byte,
                        data: [0; 2],
                        filled: 0,
                    }
                }
                _ => ParseState::Idle,
            };
            return None;
        }

        let ParseState::Command {
            command,
            data,
            filled,
        } = &mut self.state
        else {
            return None;
        };

        data[*filled] = byte;
        *filled += 1;
        if *filled < 2 {
            return None;
        }

        let (command, data) = (*command, *data);
        // Running status: further data pairs reuse the same command.
        *filled = 0;

        Some(match command {
            REPORT_VERSION => FirmataMessage::Version {
                major: data[0],
                minor: data[1],
            },
            c if c & 0xF0 == DIGITAL_MESSAGE => FirmataMessage::Digital {
                port: c & 0x0F,
                mask: data[0] | ((data[1] & 0x01) << 7),
            },
            c => FirmataMessage::Analog {
                pin: c & 0x0F,
                value: u16::from(data[0]) | (u16::from(data[1]) << 7),
            },
        })
    }
}

#[derive(Debug, Default)]
struct BoardState {
    input_ports: [Option<u8>; NUM_PORTS],
    output_masks: [u8; NUM_PORTS],
    modes: HashMap<u8, u8>,
    version: Option<(u8, u8)>,
}

impl BoardState {
    fn apply(&mut self, message: FirmataMessage) {
        match message {
            FirmataMessage::Digital { port, mask } => {
                if let Some(slot) = self.input_ports.get_mut(port as usize) {
                    *slot = Some(mask);
                }
            }
            FirmataMessage::Version { major, minor } => self.version = Some((major, minor)),
            FirmataMessage::Analog { .. } | FirmataMessage::Sysex(_) => {}
        }
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Firmata board over any async byte stream.
pub struct FirmataBoard {
    label: String,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    state: Arc<Mutex<BoardState>>,
    connected: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl FirmataBoard {
    /// Wrap a connected stream and start the reader task.
    pub fn from_stream<S>(stream: S, label: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let label = label.into();
        let (mut read_half, write_half) = tokio::io::split(stream);
        let state = Arc::new(Mutex::new(BoardState::default()));
        let connected = Arc::new(AtomicBool::new(true));

        let task_state = Arc::clone(&state);
        let task_connected = Arc::clone(&connected);
        let task_label = label.clone();
        let reader = tokio::spawn(async move {
            let mut parser = FirmataParser::new();
            let mut buf = [0u8; 256];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        tracing::warn!(port = %task_label, "Controller closed the connection");
                        break;
                    }
                    Ok(n) => {
                        let mut state = task_state.lock();
                        for &byte in &buf[..n] {
                            if let Some(message) = parser.push(byte) {
                                state.apply(message);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(port = %task_label, error = %e, "Controller read failed");
                        break;
                    }
                }
            }
            task_connected.store(false, Ordering::SeqCst);
        });

        let writer: BoxedWriter = Box::new(write_half);
        Self {
            label,
            writer: tokio::sync::Mutex::new(Some(writer)),
            state,
            connected,
            reader: Mutex::new(Some(reader)),
        }
    }

    async fn send(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(anyhow!("controller on {} is disconnected", self.label));
        }
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| anyhow!("controller on {} is closed", self.label))?;
        let result = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            self.connected.store(false, Ordering::SeqCst);
            return Err(anyhow!("write to {} failed: {e}", self.label));
        }
        Ok(())
    }

    fn mode_of(&self, pin: u8) -> Option<u8> {
        self.state.lock().modes.get(&pin).copied()
    }

    /// Firmware protocol version, once the board reported it.
    pub fn version(&self) -> Option<(u8, u8)> {
        self.state.lock().version
    }
}

fn port_and_bit(pin: u8) -> (u8, u8) {
    (pin / 8, pin % 8)
}

#[async_trait]
impl DigitalPort for FirmataBoard {
    async fn configure_input(&self, pin: u8) -> Result<()> {
        let (port, _) = port_and_bit(pin);
        if port as usize >= NUM_PORTS {
            return Err(anyhow!("pin {pin} out of range"));
        }
        self.send(&encode_set_pin_mode(pin, MODE_INPUT)).await?;
        self.send(&encode_report_digital(port, true)).await?;
        self.state.lock().modes.insert(pin, MODE_INPUT);
        Ok(())
    }

    async fn configure_output(&self, pin: u8) -> Result<()> {
        if port_and_bit(pin).0 as usize >= NUM_PORTS {
            return Err(anyhow!("pin {pin} out of range"));
        }
        self.send(&encode_set_pin_mode(pin, MODE_OUTPUT)).await?;
        self.state.lock().modes.insert(pin, MODE_OUTPUT);
        Ok(())
    }

    async fn read(&self, pin: u8) -> Result<Option<bool>> {
        if !self.is_connected() {
            return Err(anyhow!("controller on {} is disconnected", self.label));
        }
        if self.mode_of(pin) != Some(MODE_INPUT) {
            return Err(anyhow!("pin {pin} is not configured as input"));
        }
        let (port, bit) = port_and_bit(pin);
        let state = self.state.lock();
        Ok(state.input_ports[port as usize].map(|mask| mask & (1 << bit) != 0))
    }

    async fn write(&self, pin: u8, level: bool) -> Result<()> {
        if self.mode_of(pin) != Some(MODE_OUTPUT) {
            return Err(anyhow!("pin {pin} is not configured as output"));
        }
        let (port, bit) = port_and_bit(pin);
        let mask = {
            let mut state = self.state.lock();
            let mask = &mut state.output_masks[port as usize];
            if level {
                *mask |= 1 << bit;
            } else {
                *mask &= !(1 << bit);
            }
            *mask
        };
        self.send(&encode_digital_message(port, mask)).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
        }
        let writer = self.writer.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut writer) = writer {
            writer.shutdown().await?;
            tracing::info!(port = %self.label, "Controller connection closed");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        match self.version() {
            Some((major, minor)) => format!("Firmata {major}.{minor} on {}", self.label),
            None => format!("Firmata on {}", self.label),
        }
    }
}

impl Drop for FirmataBoard {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

/// A serial port seen during enumeration.
#[derive(Debug, Clone)]
pub struct PortListing {
    /// OS device name
    pub name: String,
    /// USB vendor ID, for USB ports
    pub vendor_id: Option<u16>,
    /// USB product ID, for USB ports
    pub product_id: Option<u16>,
    /// USB product string, if reported
    pub product: Option<String>,
}

/// Enumerate serial ports.
#[cfg(feature = "instrument_serial")]
pub fn list_ports() -> AppResult<Vec<PortListing>> {
    use tokio_serial::SerialPortType;

    let ports = tokio_serial::available_ports().map_err(|e| DaqError::Serial(e.to_string()))?;
    Ok(ports
        .into_iter()
        .map(|port| match port.port_type {
            SerialPortType::UsbPort(info) => PortListing {
                name: port.port_name,
                vendor_id: Some(info.vid),
                product_id: Some(info.pid),
                product: info.product,
            },
            _ => PortListing {
                name: port.port_name,
                vendor_id: None,
                product_id: None,
                product: None,
            },
        })
        .collect())
}

/// Serial ports are unavailable without `instrument_serial`.
#[cfg(not(feature = "instrument_serial"))]
pub fn list_ports() -> AppResult<Vec<PortListing>> {
    Err(DaqError::FeatureNotEnabled("instrument_serial".into()))
}

/// First listed port whose USB vendor ID is accepted.
pub fn select_port(ports: &[PortListing], vendor_ids: &[u16]) -> Option<String> {
    ports
        .iter()
        .find(|p| p.vendor_id.is_some_and(|vid| vendor_ids.contains(&vid)))
        .map(|p| p.name.clone())
}

/// Resolve the port from configuration, scanning if `auto_detect_port` is set.
pub fn resolve_port(config: &ControllerConfig) -> AppResult<String> {
    if config.auto_detect_port {
        let ports = list_ports()?;
        let port = select_port(&ports, &config.usb_vendor_ids).ok_or_else(|| {
            DaqError::ControllerNotConnected(format!(
                "no serial port with USB vendor id in {:04x?}",
                config.usb_vendor_ids
            ))
        })?;
        tracing::info!(port = %port, "Controller detected");
        return Ok(port);
    }
    config
        .port
        .clone()
        .ok_or_else(|| DaqError::invalid_config("controller.port", "no port configured"))
}

/// Open the configured serial port and wait for the board to come out of reset.
#[cfg(feature = "instrument_serial")]
pub async fn connect(config: &ControllerConfig) -> AppResult<FirmataBoard> {
    use tokio_serial::SerialPortBuilderExt;

    let port = resolve_port(config)?;
    let stream = tokio_serial::new(&port, config.baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| DaqError::ControllerNotConnected(format!("{port}: {e}")))?;

    // Opening the port resets most boards; Firmata ignores input until it is up.
    tokio::time::sleep(std::time::Duration::from_millis(config.board_setup_wait_ms)).await;

    let board = FirmataBoard::from_stream(stream, port.clone());
    tracing::info!(port = %port, baud = config.baud_rate, "Connected to controller");
    Ok(board)
}

/// Serial ports are unavailable without `instrument_serial`.
#[cfg(not(feature = "instrument_serial"))]
pub async fn connect(_config: &ControllerConfig) -> AppResult<FirmataBoard> {
    Err(DaqError::FeatureNotEnabled("instrument_serial".into()))
}
