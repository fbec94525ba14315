use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use bytes::BytesMut;
use itertools::Itertools;
use regex::Regex;

use crate::error::{Error, Result};

/// Where the receiver puts validated payload bytes.
pub trait Destination {
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Called once when the transfer ends cleanly.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Destination for Vec<u8> {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }
}

impl Destination for BytesMut {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }
}

/// Opens a destination once the session id is known.
pub trait Sink {
    type Dest: Destination;

    fn open(&mut self, session_id: u8) -> Result<Self::Dest>;
}

impl<F, D> Sink for F
where
    F: FnMut(u8) -> Result<D>,
    D: Destination,
{
    type Dest = D;

    fn open(&mut self, session_id: u8) -> Result<D> {
        self(session_id)
    }
}

const PART_SUFFIX: &str = ".part";

fn gen_file_name(session_id: u8, copy: u32) -> String {
    match copy {
        0 => format!("LOG{:03}.BIN", session_id),
        n => format!("LOG{:03}_{}.BIN", session_id, n),
    }
}

/// A completed capture found in a `CaptureDir`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CaptureFile {
    pub session_id: u8,
    pub copy: u32,
    pub path: PathBuf,
}

/// Directory on the capture device's removable storage.
///
/// Captures are named after the session id, `LOG007.BIN`, with `_1`, `_2`,
/// ... appended when the same session is captured again.
#[derive(Debug, Clone)]
pub struct CaptureDir {
    path: PathBuf,
}

impl CaptureDir {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_dir() {
            std::fs::create_dir_all(path)?;
        }
        Ok(Self {
            path: PathBuf::from(path),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Completed captures, ordered by session id and copy.
    pub fn captures(&self) -> Result<Vec<CaptureFile>> {
        let re = Regex::new(r"^LOG(\d{3})(?:_(\d+))?\.BIN$").expect("invalid regex");

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = if let Ok(entry) = entry {
                entry
            } else {
                continue;
            };
            let file_path = entry.path();
            if !file_path.is_file() {
                continue;
            }
            let Some(caps) = file_path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| re.captures(n))
            else {
                continue;
            };

            let session_id = match caps.get(1).and_then(|v| v.as_str().parse::<u8>().ok()) {
                Some(id) => id,
                None => continue,
            };
            let copy = match caps.get(2) {
                Some(v) => match v.as_str().parse::<u32>() {
                    Ok(copy) => copy,
                    Err(_) => continue,
                },
                None => 0,
            };
            files.push(CaptureFile {
                session_id,
                copy,
                path: file_path,
            });
        }

        Ok(files.into_iter().sorted().collect_vec())
    }

    /// Start a capture for `session_id` under the first free name.
    pub fn create(&self, session_id: u8) -> Result<FileDestination> {
        let mut copy = 0;
        let path = loop {
            let path = self.path.join(gen_file_name(session_id, copy));
            if !path.exists() && !part_path(&path).exists() {
                break path;
            }
            copy = copy.checked_add(1).ok_or_else(|| {
                Error::Protocol(format!("no free capture name for session {}", session_id))
            })?;
        };

        FileDestination::create(path)
    }
}

impl Sink for CaptureDir {
    type Dest = FileDestination;

    fn open(&mut self, session_id: u8) -> Result<FileDestination> {
        self.create(session_id)
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

/// Capture file written through a `.part` file, renamed into place by
/// `finish`. An aborted transfer leaves only the `.part` file behind.
#[derive(Debug)]
pub struct FileDestination {
    path: PathBuf,
    part: PathBuf,
    writer: BufWriter<File>,
    written: u64,
}

impl FileDestination {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = PathBuf::from(path.as_ref());
        let part = part_path(&path);
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part)?;

        tracing::debug!("Open capture {:?}", part);
        Ok(Self {
            path,
            part,
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    /// Final path of the capture.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl Destination for FileDestination {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        std::fs::rename(&self.part, &self.path)?;
        tracing::info!("Capture complete {:?}, {} bytes", self.path, self.written);
        Ok(())
    }
}
