//! TCP stream relay
//!
//! Connects to the requested remote endpoint and pumps bytes both ways:
//! socket reads become `data` messages, `data` events are written to the
//! socket. When the socket will not accept more output the relay parks the
//! bytes on its own save queue and asks the peer to suspend the flow until
//! the queue drains.

use super::open_result_for;
use bytes::Bytes;
use muxtun_core::{Connection, FlowEvent, Tunnel};
use muxtun_proto::{CloseDirection, Message, ResultCode};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

pub(crate) async fn run(
    tunnel: Tunnel,
    conn: Arc<Connection>,
    mut events: UnboundedReceiver<FlowEvent>,
    host: String,
    port: u16,
) {
    let id = conn.id();
    let stream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            let code = open_result_for(&e);
            warn!(id, host = %host, port, error = %e, "remote connect failed");
            tunnel.write_message(&Message::open_result_message(id, code));
            conn.abort();
            return;
        }
    };
    debug!(id, host = %host, port, "remote connected");
    tunnel.write_message(&Message::open_result_message(id, ResultCode::Success));

    let (mut reader, mut writer) = stream.into_split();
    let mut save_queue: VecDeque<(Bytes, usize)> = VecDeque::new();
    let mut suspended = false;
    let mut write_shut = false;
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        let reading = !suspended && !conn.close_direction().closed_for_read();
        tokio::select! {
            event = events.recv() => match event {
                Some(FlowEvent::Data(data)) => {
                    if write_shut || conn.close_direction().closed_for_write() {
                        continue;
                    }
                    match push_or_write(&writer, &mut save_queue, data) {
                        // First spill: ask the peer to stop sending.
                        Ok(true) => {
                            tunnel.write_message(&Message::suspend_message(id));
                        }
                        Ok(false) => {}
                        Err(e) => {
                            warn!(id, error = %e, "remote write failed");
                            conn.close(CloseDirection::All);
                            break;
                        }
                    }
                }
                Some(FlowEvent::Suspend) => suspended = true,
                Some(FlowEvent::Resume) => suspended = false,
                Some(FlowEvent::Close(state)) => {
                    if state == CloseDirection::All {
                        break;
                    }
                }
                Some(FlowEvent::Datagram { .. })
                | Some(FlowEvent::Packets { .. })
                | Some(FlowEvent::OpenResult { .. }) => {
                    warn!(id, "unexpected event for tcp flow");
                }
                None => break,
            },

            ready = writer.writable(), if !save_queue.is_empty() && !write_shut => {
                let result = ready.and_then(|()| drain(&writer, &mut save_queue));
                match result {
                    Ok(true) => {
                        tunnel.write_message(&Message::resume_message(id));
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(id, error = %e, "remote write failed");
                        conn.close(CloseDirection::All);
                        break;
                    }
                }
            }

            result = reader.read(&mut buf), if reading => match result {
                Ok(0) => {
                    debug!(id, "remote closed its read side");
                    tunnel.write_message(&Message::close_message(id, CloseDirection::Write));
                    conn.close_connection(CloseDirection::Read);
                }
                Ok(n) => {
                    tunnel.write_message(&Message::data_message(id, &buf[..n]));
                }
                Err(e) => {
                    warn!(id, error = %e, "remote read failed");
                    conn.close(CloseDirection::All);
                    break;
                }
            },
        }

        // Honor a write-side half-close once queued output has flushed.
        if !write_shut && conn.close_direction().closed_for_write() && save_queue.is_empty() {
            let _ = writer.shutdown().await;
            write_shut = true;
        }
    }
}

/// Write directly when nothing is queued, otherwise append to the queue.
/// Returns `Ok(true)` when this call started the queue.
fn push_or_write(
    writer: &OwnedWriteHalf,
    queue: &mut VecDeque<(Bytes, usize)>,
    data: Bytes,
) -> io::Result<bool> {
    if !queue.is_empty() {
        queue.push_back((data, 0));
        return Ok(false);
    }
    let mut written = 0;
    while written < data.len() {
        match writer.try_write(&data[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                queue.push_back((data, written));
                return Ok(true);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(false)
}

/// Flush queued output in FIFO order. Returns `Ok(true)` when the queue was
/// fully drained.
fn drain(writer: &OwnedWriteHalf, queue: &mut VecDeque<(Bytes, usize)>) -> io::Result<bool> {
    while let Some((data, mut written)) = queue.pop_front() {
        while written < data.len() {
            match writer.try_write(&data[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    queue.push_front((data, written));
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(true)
}
