//! Text protocol sessions
//!
//! Drives the ASCII codec over any async stream: parse every complete
//! command in the read buffer, execute it against the cache, and flush the
//! accumulated responses once no further complete command is buffered (so
//! pipelined batches coalesce into few writes).

use super::Server;
use crate::error::{CacheError, ProtocolError};
use crate::protocol::{
    Command, ParseResult, PendingStorage, ResponseWriter, StorageVerb, parse,
    parse_storage_command_line, parse_storage_data,
};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub(crate) async fn session<S>(
    server: &Arc<Server>,
    stream: &mut S,
    mut read_buf: BytesMut,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut response = ResponseWriter::new(server.config.write_buffer_size);
    let mut pending_storage: Option<PendingStorage> = None;

    loop {
        // Process every complete command currently buffered
        loop {
            let parse_result = if let Some(ref pending) = pending_storage {
                parse_storage_data(&read_buf, pending)
            } else {
                parse(&read_buf)
            };

            match parse_result {
                ParseResult::Complete(cmd, consumed) => {
                    pending_storage = None;
                    let should_quit = matches!(cmd, Command::Quit);

                    execute(server, cmd, &mut response);
                    let _ = read_buf.split_to(consumed);

                    if should_quit {
                        flush(server, stream, &mut response).await?;
                        return Ok(());
                    }
                }
                ParseResult::NeedMoreData => {
                    // A storage command whose payload is still in flight
                    // must be remembered across reads
                    if pending_storage.is_none()
                        && let Ok(Some(pending)) = parse_storage_command_line(&read_buf)
                    {
                        pending_storage = Some(pending);
                    }
                    break;
                }
                ParseResult::Error(e) => {
                    server.metrics.protocol_errors.inc();
                    write_protocol_error(&e, &mut response);

                    // Recover by skipping to the next command line
                    if let Some(pos) = find_crlf(&read_buf) {
                        let _ = read_buf.split_to(pos + 2);
                    } else {
                        read_buf.clear();
                    }
                    pending_storage = None;
                }
            }
        }

        // Read buffer has no further complete command: flush the batch
        flush(server, stream, &mut response).await?;

        tokio::select! {
            _ = server.cancel_token.cancelled() => break,
            result = stream.read_buf(&mut read_buf) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => server.metrics.bytes_read.inc_by(n as u64),
                    Err(e) => {
                        debug!("Read error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

async fn flush<S>(
    server: &Arc<Server>,
    stream: &mut S,
    response: &mut ResponseWriter,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !response.is_empty() {
        let buf = response.take();
        server.metrics.bytes_written.inc_by(buf.len() as u64);
        stream.write_all(&buf).await?;
    }
    Ok(())
}

/// Map a parse failure onto the wire
fn write_protocol_error(e: &ProtocolError, response: &mut ResponseWriter) {
    match e {
        ProtocolError::UnknownCommand(_) => response.error(),
        ProtocolError::ValueTooLarge => response.server_error("object too large for cache"),
        ProtocolError::UnexpectedData => response.client_error("bad data chunk"),
        ProtocolError::KeyTooLong => response.client_error("bad command line format"),
        other => response.client_error(&other.to_string()),
    }
}

/// Execute one parsed command against the cache
pub(crate) fn execute(server: &Arc<Server>, cmd: Command<'_>, response: &mut ResponseWriter) {
    let _timer = server.metrics.cmd_latency.start_timer();
    match cmd {
        Command::Get { keys, with_cas } => {
            server.metrics.cmd_get.inc();
            for key in &keys {
                let key = Bytes::copy_from_slice(key);
                if let Ok(view) = server.cache.get(&key) {
                    if with_cas {
                        response.value_with_cas(&key, view.flags, &view.value, view.cas);
                    } else {
                        response.value(&key, view.flags, &view.value);
                    }
                }
            }
            response.end();
        }

        Command::Store {
            verb,
            key,
            flags,
            exptime,
            data,
            noreply,
        } => {
            server.metrics.cmd_set.inc();
            let key = Bytes::copy_from_slice(&key);
            let data = Bytes::copy_from_slice(&data);
            let result = match verb {
                StorageVerb::Set => server.cache.set(&key, data, flags, exptime),
                StorageVerb::Add => server.cache.add(&key, data, flags, exptime),
                StorageVerb::Replace => server.cache.replace(&key, data, flags, exptime),
                StorageVerb::Append => server.cache.append(&key, &data),
                StorageVerb::Prepend => server.cache.prepend(&key, &data),
            };
            if noreply {
                return;
            }
            match result {
                Ok(_) => response.stored(),
                // add on a live key, and replace/append/prepend on a
                // missing one, both answer NOT_STORED on the wire
                Err(CacheError::Exists) | Err(CacheError::NotFound) => response.not_stored(),
                Err(e) => write_cache_error(&e, response),
            }
        }

        Command::Cas {
            key,
            flags,
            exptime,
            cas,
            data,
            noreply,
        } => {
            server.metrics.cmd_set.inc();
            let key = Bytes::copy_from_slice(&key);
            let data = Bytes::copy_from_slice(&data);
            let result = server.cache.cas(&key, data, flags, exptime, cas);
            if noreply {
                return;
            }
            match result {
                Ok(_) => response.stored(),
                Err(CacheError::CasMismatch) => response.exists(),
                Err(CacheError::NotFound) => response.not_found(),
                Err(e) => write_cache_error(&e, response),
            }
        }

        Command::Delete { key, noreply } => {
            server.metrics.cmd_delete.inc();
            let key = Bytes::copy_from_slice(&key);
            let result = server.cache.delete(&key);
            if noreply {
                return;
            }
            match result {
                Ok(()) => response.deleted(),
                Err(CacheError::NotFound) => response.not_found(),
                Err(e) => write_cache_error(&e, response),
            }
        }

        Command::IncrDecr {
            key,
            delta,
            increment,
            noreply,
        } => {
            if increment {
                server.metrics.cmd_incr.inc();
            } else {
                server.metrics.cmd_decr.inc();
            }
            let key = Bytes::copy_from_slice(&key);
            let result = if increment {
                server.cache.incr(&key, delta)
            } else {
                server.cache.decr(&key, delta)
            };
            if noreply {
                return;
            }
            match result {
                Ok((new_value, _)) => response.numeric(new_value),
                Err(CacheError::NotFound) => response.not_found(),
                Err(e) => write_cache_error(&e, response),
            }
        }

        Command::Touch {
            key,
            exptime,
            noreply,
        } => {
            server.metrics.cmd_touch.inc();
            let key = Bytes::copy_from_slice(&key);
            let result = server.cache.touch(&key, exptime);
            if noreply {
                return;
            }
            match result {
                Ok(_) => response.touched(),
                Err(CacheError::NotFound) => response.not_found(),
                Err(e) => write_cache_error(&e, response),
            }
        }

        Command::FlushAll { noreply } => {
            server.metrics.cmd_flush.inc();
            server.cache.flush_all();
            if !noreply {
                response.ok();
            }
        }

        Command::Stats => {
            for (name, value) in super::stat_pairs(server) {
                response.stat(name, &value);
            }
            response.end();
        }

        Command::Version => {
            response.version(concat!("memshard ", env!("CARGO_PKG_VERSION")));
        }

        Command::Quit => {
            // Handled in the session loop
        }
    }
}

fn write_cache_error(e: &CacheError, response: &mut ResponseWriter) {
    match e {
        CacheError::ValueTooLarge => response.server_error("object too large for cache"),
        CacheError::KeyTooLarge => response.client_error("bad command line format"),
        CacheError::NotNumeric => {
            response.client_error("cannot increment or decrement non-numeric value")
        }
        other => response.server_error(&other.to_string()),
    }
}

/// Find \r\n in buffer using SIMD-accelerated search
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    memchr::memchr(b'\r', buf).filter(|&i| buf.get(i + 1) == Some(&b'\n'))
}
