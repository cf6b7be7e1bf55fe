//! Local append-only spool used when the broker cannot take spillover records.
//!
//! Layout: `spillover.log` starts with a fixed header followed by frames of
//! `[len u32 LE][crc32c u32 LE][payload]`. `cursor.json` holds the read offset of the oldest
//! unconsumed frame. All file I/O happens on a dedicated thread; callers talk to it through
//! [`SpoolHandle`].

use anyhow::{anyhow, Context, Result};
use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};

const SPOOL_MAGIC: &[u8; 8] = b"TQSPOOL1";
const SPOOL_VERSION: u32 = 1;
const SPOOL_HEADER_LEN: u64 = 16;
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;
const LOG_FILE: &str = "spillover.log";
const CURSOR_FILE: &str = "cursor.json";

#[derive(Debug, Clone, Serialize)]
pub struct SpoolStatus {
    pub path: String,
    pub pending: u64,
    pub bytes: u64,
}

#[derive(Debug)]
enum SpoolCommand {
    Append {
        payload: Vec<u8>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Pop {
        respond_to: oneshot::Sender<Result<Option<Vec<u8>>>>,
    },
    Len {
        respond_to: oneshot::Sender<u64>,
    },
    Status {
        respond_to: oneshot::Sender<SpoolStatus>,
    },
}

#[derive(Clone, Debug)]
pub struct SpoolHandle {
    tx: mpsc::UnboundedSender<SpoolCommand>,
}

impl SpoolHandle {
    pub async fn append(&self, payload: Vec<u8>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SpoolCommand::Append {
                payload,
                respond_to: tx,
            })
            .map_err(|_| anyhow!("spool thread stopped"))?;
        rx.await.context("spool thread dropped response")?
    }

    pub async fn pop(&self) -> Result<Option<Vec<u8>>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SpoolCommand::Pop { respond_to: tx })
            .map_err(|_| anyhow!("spool thread stopped"))?;
        rx.await.context("spool thread dropped response")?
    }

    pub async fn len(&self) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SpoolCommand::Len { respond_to: tx })
            .map_err(|_| anyhow!("spool thread stopped"))?;
        rx.await.context("spool thread dropped response")
    }

    pub async fn status(&self) -> Result<SpoolStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SpoolCommand::Status { respond_to: tx })
            .map_err(|_| anyhow!("spool thread stopped"))?;
        rx.await.context("spool thread dropped response")
    }
}

pub fn spawn_spool_thread(spool_dir: PathBuf) -> Result<SpoolHandle> {
    let mut runtime = SpoolRuntime::open(&spool_dir)?;
    let (tx, mut rx) = mpsc::unbounded_channel::<SpoolCommand>();

    std::thread::Builder::new()
        .name("spillover-spool".to_string())
        .spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    SpoolCommand::Append {
                        payload,
                        respond_to,
                    } => {
                        let _ = respond_to.send(runtime.append(&payload));
                    }
                    SpoolCommand::Pop { respond_to } => {
                        let _ = respond_to.send(runtime.pop());
                    }
                    SpoolCommand::Len { respond_to } => {
                        let _ = respond_to.send(runtime.pending);
                    }
                    SpoolCommand::Status { respond_to } => {
                        let _ = respond_to.send(runtime.status());
                    }
                }
            }
            tracing::debug!(path = %runtime.log_path.display(), "spool thread stopped");
        })
        .context("failed to spawn spool thread")?;

    Ok(SpoolHandle { tx })
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorDisk {
    read_offset: u64,
}

struct SpoolRuntime {
    log_path: PathBuf,
    cursor_path: PathBuf,
    file: fs::File,
    read_offset: u64,
    write_offset: u64,
    pending: u64,
}

impl SpoolRuntime {
    fn open(spool_dir: &Path) -> Result<Self> {
        fs::create_dir_all(spool_dir)
            .with_context(|| format!("failed to create {}", spool_dir.display()))?;
        let log_path = spool_dir.join(LOG_FILE);
        let cursor_path = spool_dir.join(CURSOR_FILE);

        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&log_path)
            .with_context(|| format!("open {}", log_path.display()))?;

        if file.metadata()?.len() < SPOOL_HEADER_LEN {
            file.set_len(0)?;
            write_header(&mut file)?;
            file.sync_data().ok();
        } else {
            check_header(&mut file)?;
        }

        let write_offset = recover_truncate_tail(&mut file)?;
        let read_offset = load_cursor(&cursor_path)
            .unwrap_or(SPOOL_HEADER_LEN)
            .clamp(SPOOL_HEADER_LEN, write_offset);
        let pending = count_frames(&mut file, read_offset, write_offset)?;

        if pending > 0 {
            tracing::info!(
                path = %log_path.display(),
                pending,
                "local spillover spool holds records from a previous run"
            );
        }

        Ok(Self {
            log_path,
            cursor_path,
            file,
            read_offset,
            write_offset,
            pending,
        })
    }

    fn append(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() || payload.len() as u64 > MAX_FRAME_LEN as u64 {
            return Err(anyhow!("spool payload size {} out of range", payload.len()));
        }
        let len = payload.len() as u32;
        let crc = crc32c(payload);
        self.file.seek(SeekFrom::Start(self.write_offset))?;
        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.file.write_all(payload)?;
        self.file.sync_data()?;
        self.write_offset += 8 + payload.len() as u64;
        self.pending += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<Option<Vec<u8>>> {
        if self.read_offset >= self.write_offset {
            return Ok(None);
        }
        self.file.seek(SeekFrom::Start(self.read_offset))?;
        let Some(payload) = read_next_frame_payload(&mut self.file)? else {
            tracing::warn!(
                path = %self.log_path.display(),
                offset = self.read_offset,
                "corrupt spool frame; discarding tail"
            );
            self.file.set_len(self.read_offset)?;
            self.write_offset = self.read_offset;
            self.pending = 0;
            self.compact_if_drained()?;
            return Ok(None);
        };
        self.read_offset += 8 + payload.len() as u64;
        self.pending = self.pending.saturating_sub(1);
        self.compact_if_drained()?;
        self.persist_cursor()?;
        Ok(Some(payload))
    }

    fn compact_if_drained(&mut self) -> Result<()> {
        if self.read_offset < self.write_offset || self.write_offset == SPOOL_HEADER_LEN {
            return Ok(());
        }
        self.file.set_len(SPOOL_HEADER_LEN)?;
        self.file.sync_data().ok();
        self.read_offset = SPOOL_HEADER_LEN;
        self.write_offset = SPOOL_HEADER_LEN;
        self.persist_cursor()
    }

    fn persist_cursor(&self) -> Result<()> {
        let tmp = self.cursor_path.with_extension("json.tmp");
        let disk = CursorDisk {
            read_offset: self.read_offset,
        };
        fs::write(&tmp, serde_json::to_string(&disk)?).context("write cursor tmp")?;
        fs::rename(&tmp, &self.cursor_path).context("rename cursor")?;
        Ok(())
    }

    fn status(&self) -> SpoolStatus {
        SpoolStatus {
            path: self.log_path.display().to_string(),
            pending: self.pending,
            bytes: self.write_offset.saturating_sub(self.read_offset),
        }
    }
}

fn write_header(file: &mut fs::File) -> Result<()> {
    let mut header = [0u8; SPOOL_HEADER_LEN as usize];
    header[0..8].copy_from_slice(SPOOL_MAGIC);
    header[8..12].copy_from_slice(&SPOOL_VERSION.to_le_bytes());
    header[12..16].copy_from_slice(&(SPOOL_HEADER_LEN as u32).to_le_bytes());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    Ok(())
}

fn check_header(file: &mut fs::File) -> Result<()> {
    let mut header = [0u8; SPOOL_HEADER_LEN as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)?;
    if &header[0..8] != SPOOL_MAGIC {
        return Err(anyhow!("spool file has an unknown format"));
    }
    Ok(())
}

fn load_cursor(path: &Path) -> Option<u64> {
    let raw = fs::read_to_string(path).ok()?;
    let parsed: CursorDisk = serde_json::from_str(&raw).ok()?;
    Some(parsed.read_offset)
}

/// Drops a torn or corrupt tail and returns the offset just past the last valid frame.
fn recover_truncate_tail(file: &mut fs::File) -> Result<u64> {
    file.seek(SeekFrom::Start(SPOOL_HEADER_LEN))?;
    let mut pos = SPOOL_HEADER_LEN;
    while let Some(payload) = read_next_frame_payload(file)? {
        pos += 8 + payload.len() as u64;
    }
    if file.metadata()?.len() != pos {
        tracing::warn!(valid_bytes = pos, "truncating torn spool tail");
        file.set_len(pos)?;
    }
    file.seek(SeekFrom::Start(pos))?;
    Ok(pos)
}

fn count_frames(file: &mut fs::File, from: u64, to: u64) -> Result<u64> {
    file.seek(SeekFrom::Start(from))?;
    let mut pos = from;
    let mut count = 0u64;
    while pos < to {
        let Some(payload) = read_next_frame_payload(file)? else {
            break;
        };
        pos += 8 + payload.len() as u64;
        count += 1;
    }
    Ok(count)
}

fn read_next_frame_payload(file: &mut fs::File) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; 8];
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len == 0 || len > MAX_FRAME_LEN {
        return Ok(None);
    }

    let mut payload = vec![0u8; len as usize];
    match file.read_exact(&mut payload) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    if crc32c(&payload) != crc {
        return Ok(None);
    }
    Ok(Some(payload))
}
