//! ---
//! rl_section: "07-binaries"
//! rl_subsection: "binary"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Serial port transport for the bus master."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use roomlink_msg::{BusTransport, MessagingError, RxBuffer};
use tokio::io::{split, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, warn};

/// RS-485 adapter seen through a tokio serial stream.
///
/// A reader task appends every received byte to the shared [`RxBuffer`]; a writer task
/// drains frames queued by `send`. The poll loop never awaits either.
#[derive(Debug)]
pub struct SerialBus {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    rx: RxBuffer,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SerialBus {
    pub fn open(port: &str, baud_rate: u32) -> Result<Self> {
        let stream = tokio_serial::new(port, baud_rate)
            .open_native_async()
            .with_context(|| format!("unable to open serial port {port}"))?;
        let (mut read_half, mut write_half) = split(stream);

        let rx = RxBuffer::new();
        let feed = rx.clone();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        warn!("serial port closed");
                        break;
                    }
                    Ok(n) => feed.extend(&buf[..n]),
                    Err(err) => {
                        warn!(error = %err, "serial read failed");
                        break;
                    }
                }
            }
        });

        let (outgoing, mut queue) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                if let Err(err) = write_half.write_all(&frame).await {
                    warn!(error = %err, "serial write failed");
                    break;
                }
                if let Err(err) = write_half.flush().await {
                    debug!(error = %err, "serial flush failed");
                }
            }
        });

        Ok(Self {
            outgoing,
            rx,
            reader,
            writer,
        })
    }
}

impl BusTransport for SerialBus {
    fn send(&mut self, bytes: &[u8]) -> roomlink_msg::Result<()> {
        self.outgoing
            .send(bytes.to_vec())
            .map_err(|_| MessagingError::Closed("serial writer stopped"))
    }

    fn bytes_available(&self) -> usize {
        self.rx.pending()
    }

    fn take_received(&mut self) -> Vec<u8> {
        self.rx.drain()
    }

    fn name(&self) -> &'static str {
        "serial"
    }
}

impl Drop for SerialBus {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
