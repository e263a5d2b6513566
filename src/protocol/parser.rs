//! Hand-written memcached ASCII protocol parser
//!
//! Two-phase parsing:
//! 1. Parse command line (up to \r\n)
//! 2. For storage commands, read the data block
//!
//! [`parse`] handles both phases when the whole frame is already buffered;
//! when the payload has not arrived yet, the connection loop remembers the
//! parsed command line as a [`PendingStorage`] and resumes with
//! [`parse_storage_data`] once more bytes are in.

use crate::ProtocolError;
use crate::cache::MAX_VALUE_LEN;
use crate::protocol::command::{Command, MAX_KEY_LEN, StorageVerb, is_valid_key};
use std::borrow::Cow;

/// Case-insensitive command comparison (avoids allocation from to_ascii_lowercase)
#[inline]
fn cmd_eq(cmd: &[u8], expected: &[u8]) -> bool {
    cmd.len() == expected.len()
        && cmd
            .iter()
            .zip(expected.iter())
            .all(|(a, b)| a.to_ascii_lowercase() == *b)
}

/// Result of parsing
#[derive(Debug)]
pub enum ParseResult<'a> {
    /// Command fully parsed
    Complete(Command<'a>, usize),
    /// Need more data to complete parsing
    NeedMoreData,
    /// Parse error
    Error(ProtocolError),
}

/// A storage command line whose payload has not fully arrived yet
#[derive(Debug, Clone)]
pub struct PendingStorage {
    pub verb: StorageVerb,
    pub key: Vec<u8>,
    pub flags: u32,
    pub exptime: u64,
    /// Set for `cas`, absent for the plain storage verbs
    pub cas: Option<u64>,
    pub bytes: usize,
    pub noreply: bool,
    pub command_line_end: usize,
}

/// Parse a memcached command from a buffer
pub fn parse(buf: &[u8]) -> ParseResult<'_> {
    let line_end = match find_crlf(buf) {
        Some(pos) => pos,
        None => return ParseResult::NeedMoreData,
    };

    let line = &buf[..line_end];
    let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());
    let cmd_name = match parts.next() {
        Some(name) => name,
        None => return ParseResult::Error(ProtocolError::InvalidCommand("empty command".to_string())),
    };

    let storage_verb = if cmd_eq(cmd_name, b"set") {
        Some(StorageVerb::Set)
    } else if cmd_eq(cmd_name, b"add") {
        Some(StorageVerb::Add)
    } else if cmd_eq(cmd_name, b"replace") {
        Some(StorageVerb::Replace)
    } else if cmd_eq(cmd_name, b"append") {
        Some(StorageVerb::Append)
    } else if cmd_eq(cmd_name, b"prepend") {
        Some(StorageVerb::Prepend)
    } else {
        None
    };

    if let Some(verb) = storage_verb {
        return match parse_storage_line(verb, false, parts, line_end) {
            Ok(pending) => parse_storage_data(buf, &pending),
            Err(e) => ParseResult::Error(e),
        };
    }

    if cmd_eq(cmd_name, b"cas") {
        return match parse_storage_line(StorageVerb::Set, true, parts, line_end) {
            Ok(pending) => parse_storage_data(buf, &pending),
            Err(e) => ParseResult::Error(e),
        };
    }

    if cmd_eq(cmd_name, b"get") {
        parse_get(parts, line_end + 2, false)
    } else if cmd_eq(cmd_name, b"gets") {
        parse_get(parts, line_end + 2, true)
    } else if cmd_eq(cmd_name, b"delete") {
        parse_delete(parts, line_end + 2)
    } else if cmd_eq(cmd_name, b"incr") {
        parse_incr_decr(parts, line_end + 2, true)
    } else if cmd_eq(cmd_name, b"decr") {
        parse_incr_decr(parts, line_end + 2, false)
    } else if cmd_eq(cmd_name, b"touch") {
        parse_touch(parts, line_end + 2)
    } else if cmd_eq(cmd_name, b"flush_all") {
        parse_flush_all(parts, line_end + 2)
    } else if cmd_eq(cmd_name, b"stats") {
        ParseResult::Complete(Command::Stats, line_end + 2)
    } else if cmd_eq(cmd_name, b"version") {
        ParseResult::Complete(Command::Version, line_end + 2)
    } else if cmd_eq(cmd_name, b"quit") {
        ParseResult::Complete(Command::Quit, line_end + 2)
    } else {
        ParseResult::Error(ProtocolError::UnknownCommand(
            String::from_utf8_lossy(cmd_name).to_string(),
        ))
    }
}

/// Continue a storage command once (some of) its data block has arrived
pub fn parse_storage_data<'a>(buf: &'a [u8], pending: &PendingStorage) -> ParseResult<'a> {
    let data_start = pending.command_line_end + 2;
    let data_end = data_start + pending.bytes;
    let total_needed = data_end + 2; // trailing \r\n

    if buf.len() < total_needed {
        return ParseResult::NeedMoreData;
    }

    if buf[data_end] != b'\r' || buf[data_end + 1] != b'\n' {
        return ParseResult::Error(ProtocolError::UnexpectedData);
    }

    let data = Cow::Borrowed(&buf[data_start..data_end]);
    let key = Cow::Owned(pending.key.clone());

    let cmd = match pending.cas {
        Some(cas) => Command::Cas {
            key,
            flags: pending.flags,
            exptime: pending.exptime,
            cas,
            data,
            noreply: pending.noreply,
        },
        None => Command::Store {
            verb: pending.verb,
            key,
            flags: pending.flags,
            exptime: pending.exptime,
            data,
            noreply: pending.noreply,
        },
    };

    ParseResult::Complete(cmd, total_needed)
}

/// Parse the command line of a buffered storage command, if there is one.
///
/// Used by the connection loop when [`parse`] reports `NeedMoreData`: a
/// storage command whose payload is still in flight must be remembered so
/// the buffer can keep filling past the command line.
pub fn parse_storage_command_line(buf: &[u8]) -> Result<Option<PendingStorage>, ProtocolError> {
    let line_end = match find_crlf(buf) {
        Some(pos) => pos,
        None => return Ok(None),
    };

    let line = &buf[..line_end];
    let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());
    let cmd_name = match parts.next() {
        Some(name) => name,
        None => return Ok(None),
    };

    let (verb, with_cas) = if cmd_eq(cmd_name, b"set") {
        (StorageVerb::Set, false)
    } else if cmd_eq(cmd_name, b"add") {
        (StorageVerb::Add, false)
    } else if cmd_eq(cmd_name, b"replace") {
        (StorageVerb::Replace, false)
    } else if cmd_eq(cmd_name, b"append") {
        (StorageVerb::Append, false)
    } else if cmd_eq(cmd_name, b"prepend") {
        (StorageVerb::Prepend, false)
    } else if cmd_eq(cmd_name, b"cas") {
        (StorageVerb::Set, true)
    } else {
        return Ok(None);
    };

    parse_storage_line(verb, with_cas, parts, line_end).map(Some)
}

/// `<key> <flags> <exptime> <bytes> [<cas>] [noreply]`
fn parse_storage_line<'a>(
    verb: StorageVerb,
    with_cas: bool,
    mut parts: impl Iterator<Item = &'a [u8]>,
    line_end: usize,
) -> Result<PendingStorage, ProtocolError> {
    let key = parse_key(parts.next())?;

    let flags = parts
        .next()
        .and_then(parse_u32)
        .ok_or(ProtocolError::InvalidFlags)?;

    let exptime = parts
        .next()
        .and_then(parse_u64)
        .ok_or(ProtocolError::InvalidExptime)?;

    let bytes = parts
        .next()
        .and_then(parse_usize)
        .ok_or(ProtocolError::InvalidBytesLength)?;
    if bytes > MAX_VALUE_LEN {
        return Err(ProtocolError::ValueTooLarge);
    }

    let cas = if with_cas {
        Some(parts.next().and_then(parse_u64).ok_or(ProtocolError::InvalidCas)?)
    } else {
        None
    };

    let noreply = parts.next().map(|s| s == b"noreply").unwrap_or(false);

    Ok(PendingStorage {
        verb,
        key: key.to_vec(),
        flags,
        exptime,
        cas,
        bytes,
        noreply,
        command_line_end: line_end,
    })
}

fn parse_key(token: Option<&[u8]>) -> Result<&[u8], ProtocolError> {
    let key = match token {
        Some(k) if !k.is_empty() => k,
        _ => return Err(ProtocolError::InvalidCommand("missing key".to_string())),
    };
    if !is_valid_key(key) {
        if key.len() > MAX_KEY_LEN {
            return Err(ProtocolError::KeyTooLong);
        }
        return Err(ProtocolError::InvalidKey(
            String::from_utf8_lossy(key).to_string(),
        ));
    }
    Ok(key)
}

/// Find \r\n in buffer using SIMD-accelerated search
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    let mut offset = 0;
    while let Some(i) = memchr::memchr(b'\r', &buf[offset..]) {
        let pos = offset + i;
        match buf.get(pos + 1) {
            Some(b'\n') => return Some(pos),
            Some(_) => offset = pos + 1,
            None => return None,
        }
    }
    None
}

/// Parse get/gets command
fn parse_get<'a>(
    parts: impl Iterator<Item = &'a [u8]>,
    consumed: usize,
    with_cas: bool,
) -> ParseResult<'a> {
    let mut keys = Vec::new();

    for part in parts {
        match parse_key(Some(part)) {
            Ok(key) => keys.push(Cow::Borrowed(key)),
            Err(e) => return ParseResult::Error(e),
        }
    }

    if keys.is_empty() {
        return ParseResult::Error(ProtocolError::InvalidCommand(
            "get requires at least one key".to_string(),
        ));
    }

    ParseResult::Complete(Command::Get { keys, with_cas }, consumed)
}

/// Parse delete command
/// Format: delete <key> [exptime] [noreply]\r\n
/// exptime is parsed but ignored (legacy client compatibility)
fn parse_delete<'a>(mut parts: impl Iterator<Item = &'a [u8]>, consumed: usize) -> ParseResult<'a> {
    let key = match parse_key(parts.next()) {
        Ok(key) => key,
        Err(e) => return ParseResult::Error(e),
    };

    let mut noreply = false;
    for part in parts {
        if part == b"noreply" {
            noreply = true;
        }
        // A numeric token is the deprecated delete exptime; ignored
    }

    ParseResult::Complete(
        Command::Delete {
            key: Cow::Borrowed(key),
            noreply,
        },
        consumed,
    )
}

/// Parse incr/decr command: <key> <delta> [noreply]
fn parse_incr_decr<'a>(
    mut parts: impl Iterator<Item = &'a [u8]>,
    consumed: usize,
    increment: bool,
) -> ParseResult<'a> {
    let key = match parse_key(parts.next()) {
        Ok(key) => key,
        Err(e) => return ParseResult::Error(e),
    };

    let delta = match parts.next().and_then(parse_u64) {
        Some(d) => d,
        None => return ParseResult::Error(ProtocolError::InvalidDelta),
    };

    let noreply = parts.next().map(|s| s == b"noreply").unwrap_or(false);

    ParseResult::Complete(
        Command::IncrDecr {
            key: Cow::Borrowed(key),
            delta,
            increment,
            noreply,
        },
        consumed,
    )
}

/// Parse touch command: <key> <exptime> [noreply]
fn parse_touch<'a>(mut parts: impl Iterator<Item = &'a [u8]>, consumed: usize) -> ParseResult<'a> {
    let key = match parse_key(parts.next()) {
        Ok(key) => key,
        Err(e) => return ParseResult::Error(e),
    };

    let exptime = match parts.next().and_then(parse_u64) {
        Some(e) => e,
        None => return ParseResult::Error(ProtocolError::InvalidExptime),
    };

    let noreply = parts.next().map(|s| s == b"noreply").unwrap_or(false);

    ParseResult::Complete(
        Command::Touch {
            key: Cow::Borrowed(key),
            exptime,
            noreply,
        },
        consumed,
    )
}

/// Parse flush_all command: [delay] [noreply]; the delay is ignored
fn parse_flush_all<'a>(parts: impl Iterator<Item = &'a [u8]>, consumed: usize) -> ParseResult<'a> {
    let mut noreply = false;
    for part in parts {
        if part == b"noreply" {
            noreply = true;
        }
    }
    ParseResult::Complete(Command::FlushAll { noreply }, consumed)
}

/// Parse bytes as u32
fn parse_u32(bytes: &[u8]) -> Option<u32> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Parse bytes as u64
fn parse_u64(bytes: &[u8]) -> Option<u64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Parse bytes as usize
fn parse_usize(bytes: &[u8]) -> Option<usize> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get() {
        let buf = b"get foo bar baz\r\n";
        match parse(buf) {
            ParseResult::Complete(Command::Get { keys, with_cas }, consumed) => {
                assert_eq!(keys.len(), 3);
                assert_eq!(keys[0].as_ref(), b"foo");
                assert_eq!(keys[1].as_ref(), b"bar");
                assert_eq!(keys[2].as_ref(), b"baz");
                assert!(!with_cas);
                assert_eq!(consumed, buf.len());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_gets_reports_cas() {
        let buf = b"gets foo\r\n";
        match parse(buf) {
            ParseResult::Complete(Command::Get { keys, with_cas }, _) => {
                assert_eq!(keys.len(), 1);
                assert!(with_cas);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_set() {
        let buf = b"set mykey 42 3600 5\r\nhello\r\n";
        match parse(buf) {
            ParseResult::Complete(
                Command::Store {
                    verb,
                    key,
                    flags,
                    exptime,
                    data,
                    noreply,
                },
                consumed,
            ) => {
                assert_eq!(verb, StorageVerb::Set);
                assert_eq!(key.as_ref(), b"mykey");
                assert_eq!(flags, 42);
                assert_eq!(exptime, 3600);
                assert_eq!(data.as_ref(), b"hello");
                assert!(!noreply);
                assert_eq!(consumed, buf.len());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_storage_verbs() {
        for (line, verb) in [
            (&b"add k 0 0 1\r\nx\r\n"[..], StorageVerb::Add),
            (b"replace k 0 0 1\r\nx\r\n", StorageVerb::Replace),
            (b"append k 0 0 1\r\nx\r\n", StorageVerb::Append),
            (b"prepend k 0 0 1\r\nx\r\n", StorageVerb::Prepend),
        ] {
            match parse(line) {
                ParseResult::Complete(Command::Store { verb: parsed, .. }, _) => {
                    assert_eq!(parsed, verb);
                }
                other => panic!("unexpected for {:?}: {:?}", line, other),
            }
        }
    }

    #[test]
    fn test_parse_set_noreply() {
        let buf = b"set mykey 0 0 3 noreply\r\nfoo\r\n";
        match parse(buf) {
            ParseResult::Complete(Command::Store { noreply, .. }, _) => {
                assert!(noreply);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_cas() {
        let buf = b"cas mykey 1 60 5 12345\r\nhello\r\n";
        match parse(buf) {
            ParseResult::Complete(
                Command::Cas {
                    key,
                    flags,
                    exptime,
                    cas,
                    data,
                    noreply,
                },
                consumed,
            ) => {
                assert_eq!(key.as_ref(), b"mykey");
                assert_eq!(flags, 1);
                assert_eq!(exptime, 60);
                assert_eq!(cas, 12345);
                assert_eq!(data.as_ref(), b"hello");
                assert!(!noreply);
                assert_eq!(consumed, buf.len());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_cas_missing_token() {
        let buf = b"cas mykey 0 0 5\r\nhello\r\n";
        match parse(buf) {
            ParseResult::Error(ProtocolError::InvalidCas) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_delete_variants() {
        let buf = b"delete mykey\r\n";
        match parse(buf) {
            ParseResult::Complete(Command::Delete { key, noreply }, _) => {
                assert_eq!(key.as_ref(), b"mykey");
                assert!(!noreply);
            }
            other => panic!("unexpected: {:?}", other),
        }

        // Legacy exptime argument tolerated
        let buf = b"delete mykey 300 noreply\r\n";
        match parse(buf) {
            ParseResult::Complete(Command::Delete { key, noreply }, _) => {
                assert_eq!(key.as_ref(), b"mykey");
                assert!(noreply);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_incr_decr() {
        let buf = b"incr counter 5\r\n";
        match parse(buf) {
            ParseResult::Complete(
                Command::IncrDecr {
                    key,
                    delta,
                    increment,
                    noreply,
                },
                _,
            ) => {
                assert_eq!(key.as_ref(), b"counter");
                assert_eq!(delta, 5);
                assert!(increment);
                assert!(!noreply);
            }
            other => panic!("unexpected: {:?}", other),
        }

        let buf = b"decr counter 3 noreply\r\n";
        match parse(buf) {
            ParseResult::Complete(
                Command::IncrDecr {
                    increment, noreply, ..
                },
                _,
            ) => {
                assert!(!increment);
                assert!(noreply);
            }
            other => panic!("unexpected: {:?}", other),
        }

        let buf = b"incr counter abc\r\n";
        match parse(buf) {
            ParseResult::Error(ProtocolError::InvalidDelta) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_touch() {
        let buf = b"touch mykey 3600\r\n";
        match parse(buf) {
            ParseResult::Complete(
                Command::Touch {
                    key,
                    exptime,
                    noreply,
                },
                _,
            ) => {
                assert_eq!(key.as_ref(), b"mykey");
                assert_eq!(exptime, 3600);
                assert!(!noreply);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_flush_all() {
        match parse(b"flush_all\r\n") {
            ParseResult::Complete(Command::FlushAll { noreply }, _) => assert!(!noreply),
            other => panic!("unexpected: {:?}", other),
        }
        // Optional delay is ignored
        match parse(b"flush_all 30 noreply\r\n") {
            ParseResult::Complete(Command::FlushAll { noreply }, _) => assert!(noreply),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_stats_version_quit() {
        for (buf, expected) in [
            (&b"stats\r\n"[..], Command::Stats),
            (b"version\r\n", Command::Version),
            (b"quit\r\n", Command::Quit),
        ] {
            match parse(buf) {
                ParseResult::Complete(cmd, consumed) => {
                    assert_eq!(cmd, expected);
                    assert_eq!(consumed, buf.len());
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn test_parse_need_more_data() {
        match parse(b"get foo") {
            ParseResult::NeedMoreData => {}
            other => panic!("unexpected: {:?}", other),
        }

        // Complete command line, incomplete payload
        match parse(b"set k 0 0 10\r\nhel") {
            ParseResult::NeedMoreData => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_pending_storage_resume() {
        let partial = b"set mykey 7 0 5\r\nhe";
        let pending = parse_storage_command_line(partial).unwrap().unwrap();
        assert_eq!(pending.key, b"mykey");
        assert_eq!(pending.flags, 7);
        assert_eq!(pending.bytes, 5);
        assert!(pending.cas.is_none());

        match parse_storage_data(partial, &pending) {
            ParseResult::NeedMoreData => {}
            other => panic!("unexpected: {:?}", other),
        }

        let full = b"set mykey 7 0 5\r\nhello\r\n";
        match parse_storage_data(full, &pending) {
            ParseResult::Complete(Command::Store { data, .. }, consumed) => {
                assert_eq!(data.as_ref(), b"hello");
                assert_eq!(consumed, full.len());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_pending_storage_ignores_other_commands() {
        assert!(parse_storage_command_line(b"get foo\r\n").unwrap().is_none());
        assert!(parse_storage_command_line(b"set k 0 0").unwrap().is_none());
    }

    #[test]
    fn test_payload_missing_terminator() {
        let buf = b"set k 0 0 5\r\nhelloXX";
        match parse(buf) {
            ParseResult::Error(ProtocolError::UnexpectedData) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_command() {
        match parse(b"bogus\r\n") {
            ParseResult::Error(ProtocolError::UnknownCommand(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_missing_key_is_malformed() {
        match parse(b"delete\r\n") {
            ParseResult::Error(ProtocolError::InvalidCommand(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_key_too_long() {
        let mut buf = b"get ".to_vec();
        buf.extend_from_slice(&[b'a'; 251]);
        buf.extend_from_slice(b"\r\n");

        match parse(&buf) {
            ParseResult::Error(ProtocolError::KeyTooLong) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_oversized_byte_count_rejected() {
        let buf = format!("set k 0 0 {}\r\n", MAX_VALUE_LEN + 1);
        match parse(buf.as_bytes()) {
            ParseResult::Error(ProtocolError::ValueTooLarge) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_case_insensitive_commands() {
        match parse(b"GET foo\r\n") {
            ParseResult::Complete(Command::Get { .. }, _) => {}
            other => panic!("unexpected: {:?}", other),
        }

        match parse(b"SET mykey 0 0 3\r\nbar\r\n") {
            ParseResult::Complete(Command::Store { .. }, _) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_find_crlf_skips_bare_cr() {
        assert_eq!(find_crlf(b"ab\rcd\r\nef"), Some(5));
        assert_eq!(find_crlf(b"no terminator"), None);
        assert_eq!(find_crlf(b"ends with cr\r"), None);
    }
}
