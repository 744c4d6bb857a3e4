// RESP (Redis serialization protocol) codec: client commands in, replies out.
// Pure buffer manipulation; the listener owning the socket drives it.
use bytes::{Buf, Bytes, BytesMut};

pub type Result<T> = std::result::Result<T, Error>;

/// Upper bound on arguments per command; anything larger is a broken or
/// hostile client.
const MAX_ARGS: usize = 128;

/// Upper bound on a single bulk-string argument.
const MAX_BULK_LEN: usize = 64 * 1024 * 1024;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(&'static str),
}

/// One decoded client command: the name followed by its arguments.
///
/// ```
/// use bytes::BytesMut;
/// use miniqueue_resp::decode_command;
///
/// let mut buf = BytesMut::from(&b"*2\r\n$4\r\nPING\r\n$2\r\nhi\r\n"[..]);
/// let cmd = decode_command(&mut buf).expect("decode").expect("complete");
/// assert_eq!(cmd.name(), "PING");
/// assert_eq!(cmd.args.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub args: Vec<Bytes>,
}

impl Command {
    /// Uppercased command name (the first argument), empty if absent.
    pub fn name(&self) -> String {
        self.args
            .first()
            .map(|arg| String::from_utf8_lossy(arg).to_ascii_uppercase())
            .unwrap_or_default()
    }

    pub fn arg(&self, index: usize) -> Option<&Bytes> {
        self.args.get(index)
    }

    /// Argument at `index` as lossy UTF-8.
    pub fn arg_str(&self, index: usize) -> Option<String> {
        self.args
            .get(index)
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
    }
}

/// A server reply in the subset of RESP the broker speaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Bulk(Bytes),
    Integer(i64),
}

/// Append the wire form of `reply` to `buf`.
pub fn encode_reply(reply: &Reply, buf: &mut BytesMut) {
    match reply {
        Reply::Simple(text) => {
            buf.extend_from_slice(b"+");
            buf.extend_from_slice(text.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        Reply::Error(text) => {
            buf.extend_from_slice(b"-");
            buf.extend_from_slice(text.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        Reply::Bulk(data) => {
            buf.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
            buf.extend_from_slice(data);
            buf.extend_from_slice(b"\r\n");
        }
        Reply::Integer(value) => {
            buf.extend_from_slice(format!(":{value}\r\n").as_bytes());
        }
    }
}

/// Try to decode one command from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds only a partial command; nothing
/// is consumed in that case, so the caller reads more bytes and retries.
/// Accepts both RESP arrays of bulk strings and inline commands.
pub fn decode_command(buf: &mut BytesMut) -> Result<Option<Command>> {
    loop {
        if buf.is_empty() {
            return Ok(None);
        }
        if buf[0] == b'*' {
            return decode_array(buf);
        }
        match decode_inline(buf)? {
            // Blank inline lines are skipped rather than answered.
            Some(cmd) if cmd.args.is_empty() => continue,
            other => return Ok(other),
        }
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|window| window == b"\r\n")
        .map(|rel| from + rel)
}

fn parse_int(digits: &[u8], what: &'static str) -> Result<i64> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or(Error::Protocol(what))
}

fn decode_array(buf: &mut BytesMut) -> Result<Option<Command>> {
    let Some(count_end) = find_crlf(buf, 1) else {
        return Ok(None);
    };
    let count = parse_int(&buf[1..count_end], "invalid array length")?;
    if count < 0 || count as usize > MAX_ARGS {
        return Err(Error::Protocol("array length out of range"));
    }

    let mut pos = count_end + 2;
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if pos >= buf.len() {
            return Ok(None);
        }
        if buf[pos] != b'$' {
            return Err(Error::Protocol("expected bulk string"));
        }
        let Some(len_end) = find_crlf(buf, pos + 1) else {
            return Ok(None);
        };
        let len = parse_int(&buf[pos + 1..len_end], "invalid bulk length")?;
        if len < 0 || len as usize > MAX_BULK_LEN {
            return Err(Error::Protocol("bulk length out of range"));
        }
        let data_start = len_end + 2;
        let data_end = data_start + len as usize;
        if buf.len() < data_end + 2 {
            return Ok(None);
        }
        if &buf[data_end..data_end + 2] != b"\r\n" {
            return Err(Error::Protocol("bulk string missing terminator"));
        }
        args.push(Bytes::copy_from_slice(&buf[data_start..data_end]));
        pos = data_end + 2;
    }

    buf.advance(pos);
    Ok(Some(Command { args }))
}

fn decode_inline(buf: &mut BytesMut) -> Result<Option<Command>> {
    let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > MAX_BULK_LEN {
            return Err(Error::Protocol("inline command too long"));
        }
        return Ok(None);
    };
    let line_end = if newline > 0 && buf[newline - 1] == b'\r' {
        newline - 1
    } else {
        newline
    };
    let line = std::str::from_utf8(&buf[..line_end])
        .map_err(|_| Error::Protocol("inline command is not utf-8"))?;
    let args = line
        .split_ascii_whitespace()
        .map(|word| Bytes::copy_from_slice(word.as_bytes()))
        .collect();
    buf.advance(newline + 1);
    Ok(Some(Command { args }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_command_round_trip() {
        let mut buf = BytesMut::from(&b"*3\r\n$7\r\nPUBLISH\r\n$6\r\norders\r\n$5\r\nhello\r\n"[..]);
        let cmd = decode_command(&mut buf).expect("decode").expect("complete");
        assert_eq!(cmd.name(), "PUBLISH");
        assert_eq!(cmd.arg_str(1).as_deref(), Some("orders"));
        assert_eq!(cmd.arg(2), Some(&Bytes::from_static(b"hello")));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_command_leaves_buffer_untouched() {
        let wire = b"*2\r\n$4\r\nPING\r\n$2\r\nh";
        let mut buf = BytesMut::from(&wire[..]);
        assert_eq!(decode_command(&mut buf).expect("decode"), None);
        assert_eq!(&buf[..], &wire[..]);
    }

    #[test]
    fn pipelined_commands_decode_one_at_a_time() {
        let mut buf = BytesMut::from(&b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nINFO\r\n"[..]);
        let first = decode_command(&mut buf).expect("decode").expect("first");
        assert_eq!(first.name(), "PING");
        let second = decode_command(&mut buf).expect("decode").expect("second");
        assert_eq!(second.name(), "INFO");
        assert!(buf.is_empty());
    }

    #[test]
    fn inline_command_splits_on_whitespace() {
        let mut buf = BytesMut::from(&b"publish orders hello\r\n"[..]);
        let cmd = decode_command(&mut buf).expect("decode").expect("complete");
        assert_eq!(cmd.name(), "PUBLISH");
        assert_eq!(cmd.args.len(), 3);
    }

    #[test]
    fn blank_inline_lines_are_skipped() {
        let mut buf = BytesMut::from(&b"\r\nPING\r\n"[..]);
        let cmd = decode_command(&mut buf).expect("decode").expect("complete");
        assert_eq!(cmd.name(), "PING");
    }

    #[test]
    fn negative_array_length_is_rejected() {
        let mut buf = BytesMut::from(&b"*-1\r\n"[..]);
        let err = decode_command(&mut buf).expect_err("negative");
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn replies_encode_to_wire_form() {
        let mut buf = BytesMut::new();
        encode_reply(&Reply::Simple("OK".into()), &mut buf);
        encode_reply(&Reply::Error("boom".into()), &mut buf);
        encode_reply(&Reply::Bulk(Bytes::from_static(b"payload")), &mut buf);
        encode_reply(&Reply::Integer(42), &mut buf);
        assert_eq!(
            &buf[..],
            &b"+OK\r\n-boom\r\n$7\r\npayload\r\n:42\r\n"[..]
        );
    }
}
