//! Binary protocol sessions
//!
//! Frames are parsed off the read buffer one complete request at a time;
//! responses accumulate in an output buffer that is flushed whenever no
//! further complete frame is buffered, so pipelined quiet batches coalesce.
//!
//! A magic-byte mismatch on a frame boundary is unrecoverable framing and
//! closes the connection; all other failures answer an error frame.

use super::Server;
use crate::error::{CacheError, ProtocolError};
use crate::protocol::binary::{
    HEADER_LEN, Opcode, RequestHeader, Status, write_error, write_response,
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
    let mut out = BytesMut::with_capacity(server.config.write_buffer_size);

    loop {
        // Process every complete frame currently buffered
        loop {
            if read_buf.len() < HEADER_LEN {
                break;
            }
            let header = match RequestHeader::parse(&read_buf[..HEADER_LEN]) {
                Ok(header) => header,
                Err(ProtocolError::BadMagic(b)) => {
                    server.metrics.protocol_errors.inc();
                    debug!("Bad magic byte 0x{:02x}, closing connection", b);
                    flush(server, stream, &mut out).await?;
                    return Ok(());
                }
                Err(e) => {
                    // Frame sizes cannot be trusted, so the stream cannot
                    // be resynced; report and close.
                    server.metrics.protocol_errors.inc();
                    let status = match e {
                        ProtocolError::FrameTooLarge(_) => Status::ValueTooLarge,
                        _ => Status::InvalidArguments,
                    };
                    let opaque =
                        u32::from_be_bytes([read_buf[12], read_buf[13], read_buf[14], read_buf[15]]);
                    write_error(&mut out, read_buf[1], status, opaque);
                    flush(server, stream, &mut out).await?;
                    return Ok(());
                }
            };

            let total = HEADER_LEN + header.body_len as usize;
            if read_buf.len() < total {
                break;
            }
            let frame = read_buf.split_to(total);
            let (extras, key, value) = match header.split_body(&frame[HEADER_LEN..]) {
                Ok(parts) => parts,
                Err(_) => {
                    server.metrics.protocol_errors.inc();
                    write_error(&mut out, header.opcode, Status::InvalidArguments, header.opaque);
                    continue;
                }
            };

            if execute_frame(server, &header, extras, key, value, &mut out) {
                flush(server, stream, &mut out).await?;
                return Ok(());
            }
        }

        // No further complete frame buffered: flush the batch
        flush(server, stream, &mut out).await?;

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

async fn flush<S>(server: &Arc<Server>, stream: &mut S, out: &mut BytesMut) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !out.is_empty() {
        server.metrics.bytes_written.inc_by(out.len() as u64);
        stream.write_all(out).await?;
        out.clear();
    }
    Ok(())
}

fn status_for(e: CacheError) -> Status {
    match e {
        CacheError::NotFound => Status::KeyNotFound,
        CacheError::Exists | CacheError::CasMismatch => Status::KeyExists,
        CacheError::ValueTooLarge => Status::ValueTooLarge,
        CacheError::KeyTooLarge => Status::InvalidArguments,
        CacheError::NotNumeric => Status::NonNumeric,
    }
}

/// Execute one frame; returns true when the connection must close (quit)
fn execute_frame(
    server: &Arc<Server>,
    header: &RequestHeader,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
    out: &mut BytesMut,
) -> bool {
    let _timer = server.metrics.cmd_latency.start_timer();
    let raw = header.opcode;
    let opaque = header.opaque;

    let Some(opcode) = Opcode::from_u8(raw) else {
        server.metrics.protocol_errors.inc();
        write_error(out, raw, Status::UnknownCommand, opaque);
        return false;
    };
    let quiet = opcode.is_quiet();

    match opcode {
        Opcode::Get | Opcode::GetQ | Opcode::GetK | Opcode::GetKQ => {
            server.metrics.cmd_get.inc();
            if !extras.is_empty() {
                write_error(out, raw, Status::InvalidArguments, opaque);
                return false;
            }
            let k = Bytes::copy_from_slice(key);
            match server.cache.get(&k) {
                Ok(view) => {
                    let flags = view.flags.to_be_bytes();
                    let key_out = if opcode.response_includes_key() { key } else { &[] };
                    write_response(out, raw, Status::Ok, opaque, view.cas, &flags, key_out, &view.value);
                }
                // Quiet gets swallow misses so pipelined multi-gets only
                // answer for keys that exist
                Err(CacheError::NotFound) if quiet => {}
                Err(e) => write_error(out, raw, status_for(e), opaque),
            }
        }

        Opcode::Set
        | Opcode::SetQ
        | Opcode::Add
        | Opcode::AddQ
        | Opcode::Replace
        | Opcode::ReplaceQ => {
            server.metrics.cmd_set.inc();
            if extras.len() != 8 {
                write_error(out, raw, Status::InvalidArguments, opaque);
                return false;
            }
            let flags = u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]);
            let exptime = u32::from_be_bytes([extras[4], extras[5], extras[6], extras[7]]) as u64;
            let k = Bytes::copy_from_slice(key);
            let v = Bytes::copy_from_slice(value);

            let result = match opcode {
                Opcode::Add | Opcode::AddQ => server.cache.add(&k, v, flags, exptime),
                // A nonzero request cas turns set/replace into a
                // compare-and-swap, per the binary protocol
                _ if header.cas != 0 => server.cache.cas(&k, v, flags, exptime, header.cas),
                Opcode::Set | Opcode::SetQ => server.cache.set(&k, v, flags, exptime),
                _ => server.cache.replace(&k, v, flags, exptime),
            };
            match result {
                Ok(cas) => {
                    if !quiet {
                        write_response(out, raw, Status::Ok, opaque, cas, b"", b"", b"");
                    }
                }
                Err(e) => write_error(out, raw, status_for(e), opaque),
            }
        }

        Opcode::Append | Opcode::AppendQ | Opcode::Prepend | Opcode::PrependQ => {
            server.metrics.cmd_set.inc();
            let k = Bytes::copy_from_slice(key);
            let result = if matches!(opcode, Opcode::Prepend | Opcode::PrependQ) {
                server.cache.prepend(&k, value)
            } else {
                server.cache.append(&k, value)
            };
            match result {
                Ok(cas) => {
                    if !quiet {
                        write_response(out, raw, Status::Ok, opaque, cas, b"", b"", b"");
                    }
                }
                Err(e) => write_error(out, raw, status_for(e), opaque),
            }
        }

        Opcode::Delete | Opcode::DeleteQ => {
            server.metrics.cmd_delete.inc();
            let k = Bytes::copy_from_slice(key);
            match server.cache.delete(&k) {
                Ok(()) => {
                    if !quiet {
                        write_response(out, raw, Status::Ok, opaque, 0, b"", b"", b"");
                    }
                }
                Err(e) => write_error(out, raw, status_for(e), opaque),
            }
        }

        Opcode::Increment | Opcode::IncrementQ | Opcode::Decrement | Opcode::DecrementQ => {
            let increment = matches!(opcode, Opcode::Increment | Opcode::IncrementQ);
            if increment {
                server.metrics.cmd_incr.inc();
            } else {
                server.metrics.cmd_decr.inc();
            }
            if extras.len() != 20 {
                write_error(out, raw, Status::InvalidArguments, opaque);
                return false;
            }
            let delta = u64::from_be_bytes(extras[0..8].try_into().unwrap_or([0; 8]));
            let initial = u64::from_be_bytes(extras[8..16].try_into().unwrap_or([0; 8]));
            let expiration = u32::from_be_bytes(extras[16..20].try_into().unwrap_or([0; 4]));
            let k = Bytes::copy_from_slice(key);

            let result = if increment {
                server.cache.incr(&k, delta)
            } else {
                server.cache.decr(&k, delta)
            };
            match result {
                Ok((new_value, cas)) => {
                    if !quiet {
                        write_response(out, raw, Status::Ok, opaque, cas, b"", b"", &new_value.to_be_bytes());
                    }
                }
                Err(CacheError::NotFound) if expiration != u32::MAX => {
                    // Virtual-key creation: seed with the initial value
                    let seeded = Bytes::from(initial.to_string());
                    match server.cache.add(&k, seeded, 0, expiration as u64) {
                        Ok(cas) => {
                            if !quiet {
                                write_response(out, raw, Status::Ok, opaque, cas, b"", b"", &initial.to_be_bytes());
                            }
                        }
                        Err(e) => write_error(out, raw, status_for(e), opaque),
                    }
                }
                Err(e) => write_error(out, raw, status_for(e), opaque),
            }
        }

        Opcode::TouchQ | Opcode::Gat | Opcode::GatQ => {
            server.metrics.cmd_touch.inc();
            if extras.len() != 4 {
                write_error(out, raw, Status::InvalidArguments, opaque);
                return false;
            }
            let expiration = u32::from_be_bytes(extras[0..4].try_into().unwrap_or([0; 4])) as u64;
            let k = Bytes::copy_from_slice(key);

            match server.cache.touch(&k, expiration) {
                Ok(_) => match opcode {
                    Opcode::TouchQ => {} // quiet: success suppressed
                    _ => match server.cache.get(&k) {
                        Ok(view) => {
                            let flags = view.flags.to_be_bytes();
                            write_response(out, raw, Status::Ok, opaque, view.cas, &flags, b"", &view.value);
                        }
                        Err(CacheError::NotFound) if quiet => {}
                        Err(e) => write_error(out, raw, status_for(e), opaque),
                    },
                },
                Err(CacheError::NotFound) if matches!(opcode, Opcode::GatQ) => {}
                Err(e) => write_error(out, raw, status_for(e), opaque),
            }
        }

        Opcode::Flush | Opcode::FlushQ => {
            server.metrics.cmd_flush.inc();
            // Optional 4-byte delay extras; the delay itself is ignored
            if !extras.is_empty() && extras.len() != 4 {
                write_error(out, raw, Status::InvalidArguments, opaque);
                return false;
            }
            server.cache.flush_all();
            if !quiet {
                write_response(out, raw, Status::Ok, opaque, 0, b"", b"", b"");
            }
        }

        Opcode::NoOp => {
            write_response(out, raw, Status::Ok, opaque, 0, b"", b"", b"");
        }

        Opcode::Version => {
            write_response(
                out,
                raw,
                Status::Ok,
                opaque,
                0,
                b"",
                b"",
                env!("CARGO_PKG_VERSION").as_bytes(),
            );
        }

        Opcode::Stat => {
            for (name, value) in super::stat_pairs(server) {
                write_response(out, raw, Status::Ok, opaque, 0, b"", name.as_bytes(), value.as_bytes());
            }
            // Terminated by an empty key/value response
            write_response(out, raw, Status::Ok, opaque, 0, b"", b"", b"");
        }

        Opcode::Quit | Opcode::QuitQ => {
            if !quiet {
                write_response(out, raw, Status::Ok, opaque, 0, b"", b"", b"");
            }
            return true;
        }
    }

    false
}
