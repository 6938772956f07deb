//! Bidirectional byte relay between two streams

use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

const BUFFER_SIZE: usize = 8192;

/// Bytes moved by one relay, per direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// inbound -> outbound (client upload)
    pub upload: u64,
    /// outbound -> inbound (client download)
    pub download: u64,
}

impl RelayStats {
    pub fn total(&self) -> u64 {
        self.upload + self.download
    }
}

/// Pipe `inbound` and `outbound` into each other until both directions end.
///
/// When one side reaches end-of-stream the other side's write direction is
/// shut down, so half-closed connections keep working. An error in either
/// direction aborts the relay and drops both streams.
pub async fn relay<A, B>(inbound: A, outbound: B) -> io::Result<RelayStats>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut inbound_reader, mut inbound_writer) = io::split(inbound);
    let (mut outbound_reader, mut outbound_writer) = io::split(outbound);

    let (upload, download) = tokio::try_join!(
        pipe(&mut inbound_reader, &mut outbound_writer, "upload"),
        pipe(&mut outbound_reader, &mut inbound_writer, "download"),
    )?;

    Ok(RelayStats { upload, download })
}

async fn pipe<R, W>(reader: &mut R, writer: &mut W, direction: &str) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total_bytes = 0u64;

    loop {
        let n = reader.read(&mut buffer).await.map_err(|e| {
            debug!("Read error ({}): {}", direction, e);
            e
        })?;

        if n == 0 {
            trace!("End of stream ({}) after {} bytes", direction, total_bytes);
            match writer.shutdown().await {
                // The peer may already be fully gone; the data is delivered.
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                other => other?,
            }
            return Ok(total_bytes);
        }

        writer.write_all(&buffer[..n]).await.map_err(|e| {
            debug!("Write error ({}): {}", direction, e);
            e
        })?;
        writer.flush().await?;
        total_bytes += n as u64;
    }
}
