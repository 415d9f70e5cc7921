//! Sub-channel input adapters and the façade the frame loop pulls from
//! once per 24 ms tick. Adapters that deliver less than a full frame are
//! topped up with zeroes (silence).

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::net::UdpSocket;
use std::os::unix::io::AsRawFd;

use anyhow::{bail, Context, Result};
use log::warn;
use nix::fcntl::{fcntl, FcntlArg, OFlag};

use shared::dab::InputDescriptor;

/// Underruns are reported once per this many frames (6 s).
const UNDERRUN_REPORT_INTERVAL: u64 = 250;

pub trait SubchannelInput: Send {
    /// Read up to `buf.len()` bytes of payload for the current frame.
    /// Must not block longer than a fraction of the 24 ms tick.
    fn read_frame(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    fn info(&self) -> String;
}

pub fn create_input(descriptor: &InputDescriptor) -> Result<Box<dyn SubchannelInput>> {
    match descriptor.proto.as_str() {
        "file" => Ok(Box::new(FileInput::open(&descriptor.name)?)),
        "fifo" => Ok(Box::new(FifoInput::open(&descriptor.name)?)),
        "udp" => Ok(Box::new(UdpInput::open(&descriptor.name)?)),
        "silence" | "" => Ok(Box::new(SilenceInput)),
        other => bail!("unknown input protocol '{}'", other),
    }
}

/// Wraps an adapter with the zero-fill policy and rate-limited underrun
/// accounting.
pub struct InputFacade {
    subchannel_id: u8,
    input: Box<dyn SubchannelInput>,
    frames: u64,
    underruns: u64,
}

impl InputFacade {
    pub fn new(subchannel_id: u8, input: Box<dyn SubchannelInput>) -> Self {
        InputFacade {
            subchannel_id,
            input,
            frames: 0,
            underruns: 0,
        }
    }

    /// Pull one frame worth of payload; short or failed reads zero-fill
    /// the remainder.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let wanted = buf.len();
        let got = match self.input.read_frame(buf) {
            Ok(n) => n,
            Err(e) => {
                if self.underruns == 0 {
                    warn!(
                        "Sub-channel {} input {} error: {}",
                        self.subchannel_id,
                        self.input.info(),
                        e
                    );
                }
                0
            }
        };

        if got < wanted {
            buf[got..].fill(0);
            self.underruns += 1;
        }

        self.frames += 1;
        if self.frames % UNDERRUN_REPORT_INTERVAL == 0 && self.underruns > 0 {
            warn!(
                "Sub-channel {} input {}: {} underruns in the last {} frames",
                self.subchannel_id,
                self.input.info(),
                self.underruns,
                UNDERRUN_REPORT_INTERVAL
            );
            self.underruns = 0;
        }

        wanted
    }
}

/// Contiguous file, wrapped around at end of file so a short recording
/// loops forever.
pub struct FileInput {
    path: String,
    file: File,
}

impl FileInput {
    pub fn open(path: &str) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening input file {}", path))?;
        Ok(FileInput {
            path: path.to_owned(),
            file,
        })
    }
}

impl SubchannelInput for FileInput {
    fn read_frame(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        let mut rewound = false;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                if rewound {
                    // empty file
                    break;
                }
                self.file.seek(SeekFrom::Start(0))?;
                rewound = true;
                continue;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn info(&self) -> String {
        format!("file://{}", self.path)
    }
}

/// Named pipe opened non-blocking: whatever the encoder has delivered by
/// the tick goes out, the rest is silence.
pub struct FifoInput {
    path: String,
    file: File,
}

impl FifoInput {
    pub fn open(path: &str) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening input FIFO {}", path))?;

        let fd = file.as_raw_fd();
        let flags = fcntl(fd, FcntlArg::F_GETFL)?;
        fcntl(
            fd,
            FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
        )?;

        Ok(FifoInput {
            path: path.to_owned(),
            file,
        })
    }
}

impl SubchannelInput for FifoInput {
    fn read_frame(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn info(&self) -> String {
        format!("fifo://{}", self.path)
    }
}

/// Datagram input: received payloads are buffered and drained frame by
/// frame.
pub struct UdpInput {
    addr: String,
    socket: UdpSocket,
    buffer: VecDeque<u8>,
}

/// Bound on buffered bytes before old data is discarded (about half a
/// second of 384 kbit/s).
const UDP_BUFFER_MAX: usize = 24 * 1024;

impl UdpInput {
    pub fn open(addr: &str) -> Result<Self> {
        let socket =
            UdpSocket::bind(addr).with_context(|| format!("binding input UDP {}", addr))?;
        socket.set_nonblocking(true)?;
        Ok(UdpInput {
            addr: addr.to_owned(),
            socket,
            buffer: VecDeque::new(),
        })
    }
}

impl SubchannelInput for UdpInput {
    fn read_frame(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut datagram = [0u8; 2048];
        loop {
            match self.socket.recv(&mut datagram) {
                Ok(n) => {
                    self.buffer.extend(&datagram[..n]);
                    while self.buffer.len() > UDP_BUFFER_MAX {
                        self.buffer.pop_front();
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        let mut filled = 0;
        while filled < buf.len() {
            match self.buffer.pop_front() {
                Some(byte) => {
                    buf[filled] = byte;
                    filled += 1;
                }
                None => break,
            }
        }
        Ok(filled)
    }

    fn info(&self) -> String {
        format!("udp://{}", self.addr)
    }
}

/// Always delivers zeroes; useful for reserved capacity and tests.
pub struct SilenceInput;

impl SubchannelInput for SilenceInput {
    fn read_frame(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        buf.fill(0);
        Ok(buf.len())
    }

    fn info(&self) -> String {
        "silence://".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn silence_fills_buffer() {
        let mut facade = InputFacade::new(1, Box::new(SilenceInput));
        let mut buf = [0xAAu8; 32];
        assert_eq!(facade.read(&mut buf), 32);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn file_input_wraps_around() {
        let path = std::env::temp_dir().join(format!("holyrood-in-{}.bin", std::process::id()));
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[1, 2, 3, 4])
            .unwrap();

        let mut input = FileInput::open(path.to_str().unwrap()).unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(input.read_frame(&mut buf).unwrap(), 6);
        assert_eq!(buf, [1, 2, 3, 4, 1, 2]);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn short_read_zero_fills() {
        struct Short;
        impl SubchannelInput for Short {
            fn read_frame(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                buf[0] = 0xFF;
                Ok(1)
            }
            fn info(&self) -> String {
                "short".to_owned()
            }
        }

        let mut facade = InputFacade::new(1, Box::new(Short));
        let mut buf = [0xAAu8; 4];
        assert_eq!(facade.read(&mut buf), 4);
        assert_eq!(buf, [0xFF, 0, 0, 0]);
    }

    #[test]
    fn unknown_protocol_rejected() {
        let descriptor = InputDescriptor {
            proto: "zmq".to_owned(),
            name: "tcp://x".to_owned(),
        };
        assert!(create_input(&descriptor).is_err());
    }
}
