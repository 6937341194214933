//! Line and file framing over a byte stream.
//!
//! Everything on the wire is either a newline-terminated line or a file
//! payload: a mode line, a decimal byte-count line, then exactly that many
//! raw bytes. There is no other framing.

use crate::error::{CvsError, ProtocolError, Result};
use bytes::Bytes;
use md5::{Digest, Md5};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    BufWriter,
};

/// Maximum line length (1MB) - a longer line is treated as garbage, not buffered
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Maximum file payload (1GB) - prevents OOM from malicious/corrupted byte counts
pub const MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Read one line with the delimiter stripped.
///
/// Returns `Ok(None)` on a clean end of stream (no bytes read). A stream that
/// closes after some bytes but before the newline is `Truncated`.
pub async fn read_line<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Option<String>> {
    let mut buf = Vec::new();
    let n = (&mut *r)
        .take(MAX_LINE_LEN as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;

    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() > MAX_LINE_LEN {
            return Err(ProtocolError::LineTooLong {
                limit: MAX_LINE_LEN,
            }
            .into());
        }
        return Err(ProtocolError::Truncated.into());
    }
    buf.pop();
    if buf.contains(&0) {
        return Err(ProtocolError::Malformed {
            what: "line (embedded NUL)",
            line: String::from_utf8_lossy(&buf).into_owned(),
        }
        .into());
    }

    // Names are carried as `str`; a byte that is not UTF-8 would silently
    // become a different name, so it is refused instead.
    String::from_utf8(buf).map(Some).map_err(|e| {
        ProtocolError::Malformed {
            what: "line (not UTF-8)",
            line: String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
        .into()
    })
}

/// Read one line where the peer owes us one; end of stream is `Truncated`.
pub async fn expect_line<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<String> {
    read_line(r)
        .await?
        .ok_or_else(|| ProtocolError::Truncated.into())
}

pub async fn write_line<W: AsyncWrite + Unpin>(w: &mut W, line: &str) -> Result<()> {
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await?;
    Ok(())
}

/// Send a file payload: mode line, byte-count line, raw bytes.
pub async fn send_file<W: AsyncWrite + Unpin>(w: &mut W, mode: u32, data: &[u8]) -> Result<()> {
    write_line(w, &mode.to_string()).await?;
    write_line(w, &data.len().to_string()).await?;
    w.write_all(data).await?;
    Ok(())
}

/// Receive a file payload sent by [`send_file`].
///
/// Reads exactly the declared number of bytes, across as many short reads as
/// the transport needs.
pub async fn recv_file<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<(u32, Bytes)> {
    let mode_line = expect_line(r).await?;
    let mode = parse_mode(&mode_line)?;
    let size = read_size(r).await?;

    let mut data = vec![0u8; size as usize];
    r.read_exact(&mut data).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CvsError::from(ProtocolError::Truncated)
        } else {
            CvsError::from(e)
        }
    })?;

    Ok((mode, Bytes::from(data)))
}

/// Read a byte-count line and validate it against [`MAX_FILE_SIZE`].
pub async fn read_size<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<u64> {
    let line = expect_line(r).await?;
    let size: u64 = line.trim().parse().map_err(|_| ProtocolError::Malformed {
        what: "byte count",
        line: line.clone(),
    })?;
    if size > MAX_FILE_SIZE {
        return Err(ProtocolError::Malformed {
            what: "byte count (exceeds maximum)",
            line,
        }
        .into());
    }
    Ok(size)
}

/// Parse a mode line.
///
/// Accepts the decimal form we send, an octal form with a leading `0`, and
/// the symbolic `u=rw,g=r,o=r` form other peers use.
pub fn parse_mode(line: &str) -> Result<u32> {
    let line = line.trim();
    let malformed = || ProtocolError::Malformed {
        what: "file mode",
        line: line.to_string(),
    };

    if line.is_empty() {
        return Err(malformed().into());
    }
    if line.bytes().all(|b| b.is_ascii_digit()) {
        if line.len() > 1 && line.starts_with('0') {
            return u32::from_str_radix(&line[1..], 8).map_err(|_| malformed().into());
        }
        return line.parse().map_err(|_| malformed().into());
    }

    let mut mode = 0u32;
    for clause in line.split(',') {
        let (who, perms) = clause.split_once('=').ok_or_else(malformed)?;
        let shift = match who {
            "u" => 6,
            "g" => 3,
            "o" => 0,
            _ => return Err(malformed().into()),
        };
        for p in perms.chars() {
            let bit = match p {
                'r' => 4,
                'w' => 2,
                'x' => 1,
                _ => return Err(malformed().into()),
            };
            mode |= bit << shift;
        }
    }
    Ok(mode)
}

/// Lowercase hex MD5 of a payload, as carried by `Checksum` lines.
pub fn checksum_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Validate a `Checksum` argument: exactly 32 hex digits.
pub fn parse_checksum(arg: &str) -> Result<String> {
    let arg = arg.trim();
    if arg.len() != 32 || !arg.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ProtocolError::Malformed {
            what: "checksum",
            line: arg.to_string(),
        }
        .into());
    }
    Ok(arg.to_ascii_lowercase())
}

/// One end of a protocol conversation.
///
/// Owns a buffered reader and writer. Nothing is sent until [`flush`] is
/// called, so a batch of response lines goes out in one write.
///
/// [`flush`]: Connection::flush
pub struct Connection<R, W> {
    reader: BufReader<R>,
    writer: BufWriter<W>,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        }
    }

    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let line = read_line(&mut self.reader).await?;
        if let Some(ref l) = line {
            tracing::trace!("<- {}", l);
        }
        Ok(line)
    }

    pub async fn expect_line(&mut self) -> Result<String> {
        let line = expect_line(&mut self.reader).await?;
        tracing::trace!("<- {}", line);
        Ok(line)
    }

    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        tracing::trace!("-> {}", line);
        write_line(&mut self.writer, line).await
    }

    pub async fn send_file(&mut self, mode: u32, data: &[u8]) -> Result<()> {
        tracing::trace!("-> <file mode={:o} size={}>", mode, data.len());
        send_file(&mut self.writer, mode, data).await
    }

    pub async fn recv_file(&mut self) -> Result<(u32, Bytes)> {
        let (mode, data) = recv_file(&mut self.reader).await?;
        tracing::trace!("<- <file mode={:o} size={}>", mode, data.len());
        Ok((mode, data))
    }

    /// Read a payload that has no mode line (e.g. `Template`, `Rcs-diff`).
    pub async fn recv_payload(&mut self) -> Result<Bytes> {
        let size = read_size(&mut self.reader).await?;
        let mut data = vec![0u8; size as usize];
        self.reader.read_exact(&mut data).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                CvsError::from(ProtocolError::Truncated)
            } else {
                CvsError::from(e)
            }
        })?;
        Ok(Bytes::from(data))
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader.into_inner(), self.writer.into_inner())
    }
}
