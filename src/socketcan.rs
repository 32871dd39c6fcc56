//! Linux SocketCAN adapter.

use crate::bus::{CanBus, FrameSender};
use crate::error::{Error, Result};
use crate::protocol::CanFrame;
use socketcan::{CanSocket, EmbeddedFrame, ExtendedId, Id, Socket};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

struct SocketWriter {
    socket: Arc<CanSocket>,
}

impl FrameSender for SocketWriter {
    fn send(&self, frame: &CanFrame) -> Result<()> {
        log::trace!("socketcan send: {frame}");
        let id = ExtendedId::new(frame.id()).ok_or(Error::InvalidId(frame.id()))?;
        let raw = socketcan::CanFrame::new(id, frame.data())
            .ok_or(Error::PayloadTooLong(frame.data().len()))?;
        self.socket.write_frame(&raw)?;
        Ok(())
    }
}

/// A SocketCAN interface such as `can0` or `vcan0`. The bitrate is configured with `ip link`.
pub struct SocketCanBus {
    writer: Arc<SocketWriter>,
}

impl SocketCanBus {
    pub fn open(interface: &str) -> Result<Self> {
        let socket = CanSocket::open(interface)?;
        log::info!("SocketCAN interface {interface} opened");
        Ok(Self {
            writer: Arc::new(SocketWriter {
                socket: Arc::new(socket),
            }),
        })
    }
}

impl CanBus for SocketCanBus {
    fn recv(&mut self, timeout: Duration) -> Result<Option<CanFrame>> {
        let socket = &self.writer.socket;
        socket.set_read_timeout(timeout)?;
        let raw = match socket.read_frame() {
            Ok(raw) => raw,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Ok(None)
            }
            Err(err) => return Err(err.into()),
        };
        let id = raw.id();
        match (raw, id) {
            (socketcan::CanFrame::Data(data), Id::Extended(id)) => {
                CanFrame::new(id.as_raw(), data.data()).map(Some)
            }
            (other, _) => {
                log::trace!("Ignoring non extended data frame {other:?}");
                Ok(None)
            }
        }
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        self.writer.send(frame)
    }

    fn sender(&self) -> Arc<dyn FrameSender> {
        self.writer.clone()
    }
}
