//! Protocol handlers run by a worker for each connection it receives.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

use tracing::warn;

use crate::runtime::WORKER_TARGET;

/// Serves one handed-off connection.
///
/// The worker closes the stream once `handle` returns. Implementations
/// should report failures through logging rather than panicking, since a
/// resident worker keeps serving after a failed connection.
pub trait ConnectionHandler: Send + Sync {
    /// Handles a single connection.
    fn handle(&self, stream: TcpStream);
}

const CHUNK_BYTES: usize = 8 * 1024;

/// Handler that writes every received byte back to the client.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    fn handle(&self, mut stream: TcpStream) {
        if let Err(error) = echo(&mut stream) {
            warn!(
                target: WORKER_TARGET,
                error = %error,
                "echo handler error"
            );
        }
    }
}

fn echo(stream: &mut TcpStream) -> io::Result<u64> {
    let mut chunk = [0_u8; CHUNK_BYTES];
    let mut total = 0_u64;
    loop {
        let bytes_read = read_chunk_with_retry(stream, &mut chunk)?;
        let Some(data) = chunk.get(..bytes_read).filter(|data| !data.is_empty()) else {
            break;
        };
        stream.write_all(data)?;
        total += bytes_read as u64;
    }
    stream.flush()?;
    match stream.shutdown(Shutdown::Write) {
        Err(error) if error.kind() != io::ErrorKind::NotConnected => return Err(error),
        _ => {}
    }
    Ok(total)
}

pub(crate) fn read_chunk_with_retry(stream: &mut impl Read, chunk: &mut [u8]) -> io::Result<usize> {
    loop {
        match stream.read(chunk) {
            Ok(read) => return Ok(read),
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        }
    }
}
