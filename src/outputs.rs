//! ETI sinks: file and FIFO in the three ETI file flavours, TCP fan-out,
//! UDP datagrams, and the simul sink that paces the whole mux in file-only
//! setups.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::net::{ToSocketAddrs, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use log::{info, warn};

use shared::edi::TcpDispatcher;
use shared::eti::ETI_FRAME_SIZE;

/// Failed sinks are retried once per this many frames (6 s).
const SINK_RETRY_INTERVAL: u64 = 250;

pub trait EtiOutput: Send {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()>;
    fn info(&self) -> String;
}

/// `proto://name` with an optional `?type=` query for files and FIFOs.
pub fn create_output(uri: &str) -> Result<Box<dyn EtiOutput>> {
    let (proto, rest) = uri
        .split_once("://")
        .ok_or_else(|| anyhow!("output '{}' is not proto://name", uri))?;

    match proto {
        "file" => Ok(Box::new(FileOutput::create(rest, false)?)),
        "fifo" => Ok(Box::new(FileOutput::create(rest, true)?)),
        "tcp" => {
            let port: u16 = rest
                .rsplit_once(':')
                .map(|(_, p)| p)
                .unwrap_or(rest)
                .parse()
                .with_context(|| format!("output '{}': invalid port", uri))?;
            Ok(Box::new(TcpOutput::listen(port)?))
        }
        "udp" => Ok(Box::new(UdpOutput::connect(rest)?)),
        "simul" => Ok(Box::new(SimulOutput::new())),
        other => bail!("unknown output protocol '{}'", other),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EtiFileType {
    Raw,
    Streamed,
    Framed,
}

/// File and FIFO sink. The flavour is selected with `?type=raw|framed|
/// streamed`; framed keeps a frame count header up to date, raw pads every
/// frame to 6144 bytes with 0x55.
pub struct FileOutput {
    path: String,
    file: File,
    ty: EtiFileType,
    frames_written: u32,
}

impl FileOutput {
    fn parse_uri(name: &str) -> (String, Result<EtiFileType>) {
        let (path, query) = match name.split_once('?') {
            Some((p, q)) => (p, q),
            None => return (name.to_owned(), Ok(EtiFileType::Framed)),
        };

        for pair in query.split('&') {
            if let Some(("type", value)) = pair.split_once('=') {
                let ty = match value {
                    "raw" => Ok(EtiFileType::Raw),
                    "streamed" => Ok(EtiFileType::Streamed),
                    "framed" => Ok(EtiFileType::Framed),
                    other => Err(anyhow!("unsupported ETI file type '{}'", other)),
                };
                return (path.to_owned(), ty);
            }
        }
        (path.to_owned(), Ok(EtiFileType::Framed))
    }

    pub fn create(name: &str, is_fifo: bool) -> Result<Self> {
        let (path, ty) = Self::parse_uri(name);
        let ty = ty?;

        let file = if is_fifo {
            // A FIFO must already exist; opening truncates nothing.
            OpenOptions::new()
                .write(true)
                .open(&path)
                .with_context(|| format!("opening output FIFO {}", path))?
        } else {
            File::create(&path).with_context(|| format!("creating output file {}", path))?
        };

        Ok(FileOutput {
            path,
            file,
            ty,
            frames_written: 0,
        })
    }
}

impl EtiOutput for FileOutput {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.frames_written += 1;
        match self.ty {
            EtiFileType::Framed => {
                // frame count at the start of the file, then
                // {length, payload} records
                self.file.seek(SeekFrom::Start(0))?;
                self.file.write_all(&self.frames_written.to_le_bytes())?;
                self.file.seek(SeekFrom::End(0))?;
                self.file.write_all(&(frame.len() as u16).to_le_bytes())?;
                self.file.write_all(frame)?;
            }
            EtiFileType::Streamed => {
                self.file.write_all(&(frame.len() as u16).to_le_bytes())?;
                self.file.write_all(frame)?;
            }
            EtiFileType::Raw => {
                self.file.write_all(frame)?;
                if frame.len() < ETI_FRAME_SIZE {
                    let padding = vec![0x55u8; ETI_FRAME_SIZE - frame.len()];
                    self.file.write_all(&padding)?;
                }
            }
        }
        Ok(())
    }

    fn info(&self) -> String {
        format!("file://{}", self.path)
    }
}

/// TCP server sink sharing the EDI dispatcher mechanics: every connected
/// client receives each raw 6144-byte frame.
pub struct TcpOutput {
    dispatcher: TcpDispatcher,
}

impl TcpOutput {
    pub fn listen(port: u16) -> Result<Self> {
        let dispatcher = TcpDispatcher::start(port, 64, 0)
            .with_context(|| format!("binding ETI TCP output on port {}", port))?;
        info!("ETI TCP output listening on {}", dispatcher.listen_port());
        Ok(TcpOutput { dispatcher })
    }
}

impl EtiOutput for TcpOutput {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.dispatcher.write(Bytes::copy_from_slice(frame));
        Ok(())
    }

    fn info(&self) -> String {
        format!("tcp://:{}", self.dispatcher.listen_port())
    }
}

pub struct UdpOutput {
    dest: String,
    socket: UdpSocket,
}

impl UdpOutput {
    pub fn connect(dest: &str) -> Result<Self> {
        let addr = dest
            .to_socket_addrs()
            .with_context(|| format!("resolving udp output {}", dest))?
            .next()
            .ok_or_else(|| anyhow!("resolving udp output {}", dest))?;
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(addr)?;
        Ok(UdpOutput {
            dest: dest.to_owned(),
            socket,
        })
    }
}

impl EtiOutput for UdpOutput {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.socket.send(frame)?;
        Ok(())
    }

    fn info(&self) -> String {
        format!("udp://{}", self.dest)
    }
}

/// Paces the loop at one frame per 24 ms by sleeping until the frame's
/// nominal transmission time.
pub struct SimulOutput {
    start: Option<Instant>,
    frames_written: u32,
}

impl SimulOutput {
    pub fn new() -> Self {
        SimulOutput {
            start: None,
            frames_written: 0,
        }
    }
}

impl EtiOutput for SimulOutput {
    fn write_frame(&mut self, _frame: &[u8]) -> Result<()> {
        let start = *self.start.get_or_insert_with(Instant::now);
        self.frames_written += 1;

        let due = start + Duration::from_millis(24) * self.frames_written;
        let now = Instant::now();
        if due > now {
            thread::sleep(due - now);
        }
        Ok(())
    }

    fn info(&self) -> String {
        "simul://".to_owned()
    }
}

struct SinkSlot {
    output: Box<dyn EtiOutput>,
    failed: bool,
}

/// The ordered sink list of the output multiplexer. A failing sink is
/// marked and skipped, with a retry every few seconds; sink failures never
/// stop frame production.
pub struct OutputGroup {
    sinks: Vec<SinkSlot>,
    frames: u64,
}

impl OutputGroup {
    pub fn from_uris(uris: &[String]) -> Result<Self> {
        let mut sinks = Vec::with_capacity(uris.len());
        for uri in uris {
            let output = create_output(uri)?;
            info!("Output: {}", output.info());
            sinks.push(SinkSlot {
                output,
                failed: false,
            });
        }
        Ok(OutputGroup { sinks, frames: 0 })
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn write(&mut self, frame: &[u8]) {
        self.frames += 1;
        let retry = self.frames % SINK_RETRY_INTERVAL == 0;

        for sink in &mut self.sinks {
            if sink.failed && !retry {
                continue;
            }
            match sink.output.write_frame(frame) {
                Ok(()) => {
                    if sink.failed {
                        info!("Output {} recovered", sink.output.info());
                    }
                    sink.failed = false;
                }
                Err(e) => {
                    if !sink.failed {
                        warn!("Output {} failed: {}", sink.output.info(), e);
                    }
                    sink.failed = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn tmp(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("holyrood-out-{}-{}", std::process::id(), name))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn uri_type_selection() {
        let (path, ty) = FileOutput::parse_uri("/tmp/x.eti?type=raw");
        assert_eq!(path, "/tmp/x.eti");
        assert!(matches!(ty.unwrap(), EtiFileType::Raw));

        let (_, ty) = FileOutput::parse_uri("/tmp/x.eti");
        assert!(matches!(ty.unwrap(), EtiFileType::Framed));

        let (_, ty) = FileOutput::parse_uri("/tmp/x.eti?type=bogus");
        assert!(ty.is_err());
    }

    #[test]
    fn streamed_file_has_length_prefixes() {
        let path = tmp("streamed");
        let mut out = FileOutput::create(&format!("{}?type=streamed", path), false).unwrap();
        out.write_frame(&[0xAB; 100]).unwrap();
        out.write_frame(&[0xCD; 100]).unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 2 * (2 + 100));
        assert_eq!(u16::from_le_bytes([data[0], data[1]]), 100);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn framed_file_counts_frames() {
        let path = tmp("framed");
        let mut out = FileOutput::create(&format!("{}?type=framed", path), false).unwrap();
        out.write_frame(&[0xAB; 64]).unwrap();
        out.write_frame(&[0xCD; 64]).unwrap();

        let mut data = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(u32::from_le_bytes([data[0], data[1], data[2], data[3]]), 2);
        assert_eq!(data.len(), 4 + 2 * (2 + 64));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn raw_file_pads_to_frame_size() {
        let path = tmp("raw");
        let mut out = FileOutput::create(&format!("{}?type=raw", path), false).unwrap();
        out.write_frame(&[0xAB; 6000]).unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), ETI_FRAME_SIZE);
        assert!(data[6000..].iter().all(|&b| b == 0x55));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn failed_sink_does_not_stop_the_group() {
        struct Failing;
        impl EtiOutput for Failing {
            fn write_frame(&mut self, _: &[u8]) -> Result<()> {
                bail!("broken pipe")
            }
            fn info(&self) -> String {
                "failing://".to_owned()
            }
        }

        let path = tmp("group");
        let good = FileOutput::create(&format!("{}?type=raw", path), false).unwrap();
        let mut group = OutputGroup {
            sinks: vec![
                SinkSlot {
                    output: Box::new(Failing),
                    failed: false,
                },
                SinkSlot {
                    output: Box::new(good),
                    failed: false,
                },
            ],
            frames: 0,
        };

        group.write(&[0u8; ETI_FRAME_SIZE]);
        group.write(&[0u8; ETI_FRAME_SIZE]);

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 2 * ETI_FRAME_SIZE);
        std::fs::remove_file(&path).unwrap();
    }
}
