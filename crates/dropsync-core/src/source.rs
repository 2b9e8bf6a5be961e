//! Byte sources for outgoing transfers.
//!
//! The engine retains the source after a failure so `retry` can reopen a
//! fresh substream over the same bytes.

use std::io;
use std::path::PathBuf;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Where an outgoing file's bytes come from.
#[derive(Debug, Clone)]
pub enum FileSource {
    Bytes(Bytes),
    Path(PathBuf),
}

impl FileSource {
    pub async fn size(&self) -> io::Result<u64> {
        match self {
            Self::Bytes(data) => Ok(data.len() as u64),
            Self::Path(path) => Ok(tokio::fs::metadata(path).await?.len()),
        }
    }

    pub async fn open(&self) -> io::Result<SourceReader> {
        match self {
            Self::Bytes(data) => Ok(SourceReader::Bytes {
                data: data.clone(),
                offset: 0,
            }),
            Self::Path(path) => Ok(SourceReader::File(File::open(path).await?)),
        }
    }
}

pub enum SourceReader {
    Bytes { data: Bytes, offset: usize },
    File(File),
}

impl SourceReader {
    /// Next chunk of exactly `chunk_size` bytes, shorter only at the end.
    /// `None` at end of stream.
    pub async fn next_chunk(&mut self, chunk_size: usize) -> io::Result<Option<Bytes>> {
        match self {
            Self::Bytes { data, offset } => {
                if *offset >= data.len() {
                    return Ok(None);
                }
                let end = (*offset + chunk_size).min(data.len());
                let chunk = data.slice(*offset..end);
                *offset = end;
                Ok(Some(chunk))
            }
            Self::File(file) => {
                let mut buf = vec![0u8; chunk_size];
                let mut filled = 0;
                while filled < chunk_size {
                    let n = file.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                if filled == 0 {
                    return Ok(None);
                }
                buf.truncate(filled);
                Ok(Some(Bytes::from(buf)))
            }
        }
    }
}
