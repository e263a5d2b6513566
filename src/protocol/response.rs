//! Memcached ASCII protocol response builder

use bytes::BytesMut;
use itoa::Buffer;

/// Response writer for memcached ASCII protocol
pub struct ResponseWriter {
    buf: BytesMut,
}

impl ResponseWriter {
    /// Create a new response writer with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Get the internal buffer
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Take the buffer, leaving an empty buffer in its place
    pub fn take(&mut self) -> BytesMut {
        std::mem::take(&mut self.buf)
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Returns true if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Write a VALUE line for a get response
    /// Format: VALUE <key> <flags> <bytes>\r\n<data>\r\n
    pub fn value(&mut self, key: &[u8], flags: u32, data: &[u8]) {
        self.value_line(key, flags, data, None);
    }

    /// Write a VALUE line for a gets response, including the cas token
    /// Format: VALUE <key> <flags> <bytes> <cas>\r\n<data>\r\n
    pub fn value_with_cas(&mut self, key: &[u8], flags: u32, data: &[u8], cas: u64) {
        self.value_line(key, flags, data, Some(cas));
    }

    fn value_line(&mut self, key: &[u8], flags: u32, data: &[u8], cas: Option<u64>) {
        let mut itoa_buf = Buffer::new();
        self.buf.extend_from_slice(b"VALUE ");
        self.buf.extend_from_slice(key);
        self.buf.extend_from_slice(b" ");
        self.buf
            .extend_from_slice(itoa_buf.format(flags).as_bytes());
        self.buf.extend_from_slice(b" ");
        self.buf
            .extend_from_slice(itoa_buf.format(data.len()).as_bytes());
        if let Some(cas) = cas {
            self.buf.extend_from_slice(b" ");
            self.buf.extend_from_slice(itoa_buf.format(cas).as_bytes());
        }
        self.buf.extend_from_slice(b"\r\n");
        self.buf.extend_from_slice(data);
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Write END to terminate a get or stats response
    pub fn end(&mut self) {
        self.buf.extend_from_slice(b"END\r\n");
    }

    /// Write STORED response
    pub fn stored(&mut self) {
        self.buf.extend_from_slice(b"STORED\r\n");
    }

    /// Write NOT_STORED response
    pub fn not_stored(&mut self) {
        self.buf.extend_from_slice(b"NOT_STORED\r\n");
    }

    /// Write EXISTS response (cas token mismatch)
    pub fn exists(&mut self) {
        self.buf.extend_from_slice(b"EXISTS\r\n");
    }

    /// Write NOT_FOUND response
    pub fn not_found(&mut self) {
        self.buf.extend_from_slice(b"NOT_FOUND\r\n");
    }

    /// Write DELETED response
    pub fn deleted(&mut self) {
        self.buf.extend_from_slice(b"DELETED\r\n");
    }

    /// Write TOUCHED response
    pub fn touched(&mut self) {
        self.buf.extend_from_slice(b"TOUCHED\r\n");
    }

    /// Write OK response
    pub fn ok(&mut self) {
        self.buf.extend_from_slice(b"OK\r\n");
    }

    /// Write a bare numeric response (incr/decr success)
    pub fn numeric(&mut self, value: u64) {
        let mut itoa_buf = Buffer::new();
        self.buf.extend_from_slice(itoa_buf.format(value).as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Write one STAT line
    /// Format: STAT <name> <value>\r\n
    pub fn stat(&mut self, name: &str, value: &str) {
        self.buf.extend_from_slice(b"STAT ");
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.extend_from_slice(b" ");
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Write VERSION response
    /// Format: VERSION <version_string>\r\n
    pub fn version(&mut self, version: &str) {
        self.buf.extend_from_slice(b"VERSION ");
        self.buf.extend_from_slice(version.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Write ERROR response (unknown command)
    pub fn error(&mut self) {
        self.buf.extend_from_slice(b"ERROR\r\n");
    }

    /// Write CLIENT_ERROR response
    pub fn client_error(&mut self, message: &str) {
        self.buf.extend_from_slice(b"CLIENT_ERROR ");
        self.buf.extend_from_slice(message.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Write SERVER_ERROR response
    pub fn server_error(&mut self, message: &str) {
        self.buf.extend_from_slice(b"SERVER_ERROR ");
        self.buf.extend_from_slice(message.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }
}

impl Default for ResponseWriter {
    fn default() -> Self {
        Self::new(4096)
    }
}
