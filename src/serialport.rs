use crate::adapter::DataAdapter;
use crate::inverter::{self, FrameSync, DEFAULT_SLAVE_ID};
use crate::jk;
use crate::snapshot::Snapshot;
use anyhow::{bail, Context, Result};
use std::time::{Duration, Instant};

/// Shortest gap between two requests the battery tolerates.
pub const MINIMUM_DELAY: Duration = Duration::from_millis(10);

/// Serial master polling the battery on its vendor protocol.
#[derive(Debug)]
pub struct JkBms {
    serial: Box<dyn serialport::SerialPort>,
    last_execution: Instant,
    delay: Duration,
}

impl JkBms {
    pub fn new(port: &str) -> Result<Self> {
        Ok(Self {
            serial: serialport::new(port, 115_200)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .open()
                .with_context(|| format!("Cannot open serial port '{}'", port))?,
            last_execution: Instant::now(),
            delay: MINIMUM_DELAY,
        })
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.serial
            .set_timeout(timeout)
            .map_err(anyhow::Error::from)
    }

    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = Duration::max(delay, MINIMUM_DELAY);
    }

    fn serial_await_delay(&self) {
        let last_exec_diff = Instant::now().duration_since(self.last_execution);
        if let Some(time_until_delay_reached) = self.delay.checked_sub(last_exec_diff) {
            std::thread::sleep(time_until_delay_reached);
        }
    }

    fn send_bytes(&mut self, tx_buffer: &[u8]) -> Result<()> {
        // clear all incoming serial to avoid data collision
        loop {
            let pending = self
                .serial
                .bytes_to_read()
                .with_context(|| "Cannot read number of pending bytes")?;
            if pending > 0 {
                log::trace!("Got {} pending bytes", pending);
                let mut buf: Vec<u8> = vec![0; 64];
                let received = self
                    .serial
                    .read(buf.as_mut_slice())
                    .with_context(|| "Cannot read pending bytes")?;
                log::trace!("Read {} pending bytes", received);
            } else {
                break;
            }
        }
        self.serial_await_delay();

        self.serial
            .write_all(tx_buffer)
            .with_context(|| "Cannot write to serial")?;
        Ok(())
    }

    /// Requests a full status frame and decodes it.
    pub fn poll_status(&mut self) -> Result<Snapshot> {
        self.send_bytes(&jk::STATUS_REQUEST)?;

        // the declared length counts every byte after the length field
        let mut header = [0u8; 4];
        self.serial
            .read_exact(&mut header)
            .with_context(|| "Cannot receive status frame header")?;
        if header[0..2] != jk::FRAME_MARKER {
            bail!(
                "Unexpected status frame marker: {:02X} {:02X}",
                header[0],
                header[1]
            );
        }
        let frame_length = u16::from_be_bytes([header[2], header[3]]) as usize;

        let mut frame = vec![0u8; 4 + frame_length];
        frame[..4].copy_from_slice(&header);
        self.serial
            .read_exact(&mut frame[4..])
            .with_context(|| "Cannot receive status frame body")?;
        self.last_execution = Instant::now();
        log::trace!("poll_status: {:02X?}", frame);

        let payload = jk::strip_status_frame(&frame)?;
        Ok(jk::decode_status(payload)?)
    }
}

/// Serial slave answering register reads from the inverter.
#[derive(Debug)]
pub struct InverterBus {
    serial: Box<dyn serialport::SerialPort>,
    sync: FrameSync,
    slave_id: u8,
}

impl InverterBus {
    pub fn new(port: &str, slave_id: u8) -> Result<Self> {
        Ok(Self {
            serial: serialport::new(port, 9600)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .timeout(Duration::from_millis(50))
                .open()
                .with_context(|| format!("Cannot open serial port '{}'", port))?,
            sync: FrameSync::new(slave_id),
            slave_id,
        })
    }

    pub fn with_default_slave_id(port: &str) -> Result<Self> {
        Self::new(port, DEFAULT_SLAVE_ID)
    }

    fn read_pending(&mut self) -> Result<Vec<u8>> {
        let pending = self
            .serial
            .bytes_to_read()
            .with_context(|| "Cannot read number of pending bytes")? as usize;
        if pending == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; pending];
        let received = self
            .serial
            .read(buf.as_mut_slice())
            .with_context(|| "Cannot read pending bytes")?;
        buf.truncate(received);
        log::trace!("read_pending: {:02X?}", buf);
        Ok(buf)
    }

    /// Drains the receive buffer, answers every complete request in it
    /// and returns. Call this in a tight loop.
    pub fn service(&mut self, adapter: &dyn DataAdapter) -> Result<()> {
        let pending = self.read_pending()?;
        let mut rx = pending.iter().copied();

        while self.sync.pump(&mut rx) {
            let Some(frame) = self.sync.frame().copied() else {
                break;
            };
            self.sync.reset();

            if let Some(reply) = inverter::handle_frame(&frame, self.slave_id, adapter) {
                // answering while newer bytes already queue up would pair
                // this reply with a request we have not read yet
                let quiet = rx.len() == 0
                    && self
                        .serial
                        .bytes_to_read()
                        .with_context(|| "Cannot read number of pending bytes")?
                        == 0;
                if quiet {
                    log::trace!("reply: {:02X?}", reply);
                    self.serial
                        .write_all(&reply)
                        .with_context(|| "Cannot write to serial")?;
                } else {
                    log::debug!("Bus busy after request, dropping reply");
                }
            }
        }
        Ok(())
    }
}
