//! Raw frame I/O on a device.
//!
//! The relay only sees [`FrameReader`] and [`FrameWriter`]. Real devices are
//! opened through pnet's datalink channels; [`memory`] provides an in-process
//! pair used by the tests.

use std::io::{self, ErrorKind};
use std::time::Duration;

use pnet::datalink::{self, Channel, DataLinkReceiver, DataLinkSender};

use crate::device::{Device, DeviceError};

pub trait FrameReader: Send {
    /// Waits for the next frame. `Ok(None)` means the read timeout elapsed.
    fn next_frame(&mut self) -> io::Result<Option<&[u8]>>;
}

pub trait FrameWriter: Send {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// The two halves of an open device.
pub struct Link {
    pub reader: Box<dyn FrameReader>,
    pub writer: Box<dyn FrameWriter>,
}

/// Opens a capture/inject channel on `device`. Reads give up after
/// `read_timeout` so loops can notice shutdown.
pub fn open(device: &Device, read_timeout: Duration) -> Result<Link, DeviceError> {
    let iface = datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == device.name)
        .ok_or_else(|| DeviceError::DeviceNotFound(device.name.clone()))?;

    let config = datalink::Config {
        read_timeout: Some(read_timeout),
        promiscuous: true,
        ..Default::default()
    };

    match datalink::channel(&iface, config) {
        Ok(Channel::Ethernet(tx, rx)) => Ok(Link {
            reader: Box::new(PnetReader { rx }),
            writer: Box::new(PnetWriter { tx }),
        }),
        Ok(_) => Err(DeviceError::Open {
            name: device.name.clone(),
            source: io::Error::new(ErrorKind::Unsupported, "not an ethernet channel"),
        }),
        Err(e) => Err(DeviceError::Open {
            name: device.name.clone(),
            source: e,
        }),
    }
}

struct PnetReader {
    rx: Box<dyn DataLinkReceiver>,
}

impl FrameReader for PnetReader {
    fn next_frame(&mut self) -> io::Result<Option<&[u8]>> {
        match self.rx.next() {
            Ok(frame) => Ok(Some(frame)),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(None)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e),
        }
    }
}

struct PnetWriter {
    tx: Box<dyn DataLinkSender>,
}

impl FrameWriter for PnetWriter {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        match self.tx.send_to(frame, None) {
            Some(result) => result,
            None => Err(io::Error::new(ErrorKind::Other, "send buffer unavailable")),
        }
    }
}

/// Channel-backed links for driving the relay without a network.
pub mod memory {
    use std::io::{self, ErrorKind};
    use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
    use std::time::Duration;

    use super::{FrameReader, FrameWriter, Link};

    /// The far side of an in-memory link.
    pub struct Peer {
        /// Frames pushed here are read by the relay.
        pub inject: Sender<Vec<u8>>,
        /// Frames the relay sent on the link.
        pub sent: Receiver<Vec<u8>>,
    }

    pub fn link(read_timeout: Duration) -> (Link, Peer) {
        let (inject, inbox) = mpsc::channel();
        let (outbox, sent) = mpsc::channel();
        let link = Link {
            reader: Box::new(ChannelReader {
                inbox,
                read_timeout,
                current: Vec::new(),
            }),
            writer: Box::new(ChannelWriter { outbox }),
        };
        (link, Peer { inject, sent })
    }

    struct ChannelReader {
        inbox: Receiver<Vec<u8>>,
        read_timeout: Duration,
        current: Vec<u8>,
    }

    impl FrameReader for ChannelReader {
        fn next_frame(&mut self) -> io::Result<Option<&[u8]>> {
            match self.inbox.recv_timeout(self.read_timeout) {
                Ok(frame) => {
                    self.current = frame;
                    Ok(Some(self.current.as_slice()))
                }
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    Err(io::Error::new(ErrorKind::BrokenPipe, "peer closed"))
                }
            }
        }
    }

    struct ChannelWriter {
        outbox: Sender<Vec<u8>>,
    }

    impl FrameWriter for ChannelWriter {
        fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
            self.outbox
                .send(frame.to_vec())
                .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "peer closed"))
        }
    }

}
