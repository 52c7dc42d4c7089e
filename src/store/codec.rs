//! Wire codec for the store protocol.
//!
//! Commands are encoded as arrays of length-prefixed bulk strings:
//!
//! ```text
//! *3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n
//! ```
//!
//! Replies carry a one byte tag:
//!
//! | Tag | Meaning |
//! |-----|---------|
//! | `+` | status line, `OK` decodes to [`Value::Okay`] |
//! | `-` | error line |
//! | `:` | integer |
//! | `$` | bulk string, `$-1` is null |
//! | `*` | array of nested replies, `*-1` is null |

const CRLF: &[u8] = b"\r\n";

/// Largest bulk string a reply may announce, as in Redis `proto-max-bulk-len`.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Largest element count a reply array may announce.
const MAX_ARRAY_LEN: i64 = i32::MAX as i64;

/// Elements reserved up front for an array; the rest grows as items decode.
const ARRAY_PREALLOC: usize = 1024;

/// A decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Nil,
    Okay,
    Status(String),
    Int(i64),
    Bulk(Vec<u8>),
    Array(Vec<Value>),
    Error(String),
}

impl Value {
    /// Returns the value as UTF-8 text when it is a bulk or status string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Bulk(bytes) => std::str::from_utf8(bytes).ok(),
            Self::Status(s) => Some(s),
            Self::Okay => Some("OK"),
            _ => None,
        }
    }

    /// Consumes the value into an owned string, `None` for null replies.
    pub fn into_string(self) -> Option<String> {
        match self {
            Self::Bulk(bytes) => String::from_utf8(bytes).ok(),
            Self::Status(s) => Some(s),
            Self::Okay => Some("OK".to_string()),
            Self::Int(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Integer view; bulk strings holding digits are parsed too.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Bulk(_) | Self::Status(_) => self.as_str()?.parse().ok(),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Interprets an array reply of alternating field/value entries.
    pub fn into_pairs(self) -> Vec<(String, String)> {
        let Self::Array(items) = self else {
            return Vec::new();
        };
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            if let (Some(field), Some(value)) = (field.into_string(), value.into_string()) {
                pairs.push((field, value));
            }
        }
        pairs
    }
}

/// One command argument.
///
/// `Seq` arguments are flattened depth-first when the command is encoded,
/// which lets a single mapping stand for all the field/value pairs of a
/// multi-set command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Bytes(Vec<u8>),
    Seq(Vec<Arg>),
}

impl Arg {
    /// Builds a flattened field/value sequence from pairs.
    pub fn pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<Arg>,
        V: Into<Arg>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut items = Vec::new();
        for (k, v) in pairs {
            items.push(k.into());
            items.push(v.into());
        }
        Self::Seq(items)
    }

    /// Number of wire arguments once flattened.
    pub fn count(&self) -> usize {
        match self {
            Self::Bytes(_) => 1,
            Self::Seq(items) => items.iter().map(Arg::count).sum(),
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Self::Bytes(bytes) => write_bulk(out, bytes),
            Self::Seq(items) => {
                for item in items {
                    item.write_to(out);
                }
            }
        }
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Self::Bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Self::Bytes(s.into_bytes())
    }
}

impl From<&String> for Arg {
    fn from(s: &String) -> Self {
        Self::Bytes(s.as_bytes().to_vec())
    }
}

impl From<&[u8]> for Arg {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Arg {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

macro_rules! arg_from_display {
    ($($t:ty),*) => {
        $(impl From<$t> for Arg {
            fn from(v: $t) -> Self {
                Self::Bytes(v.to_string().into_bytes())
            }
        })*
    };
}

arg_from_display!(i32, i64, u32, u64, usize, f64);

fn write_bulk(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(b'$');
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.extend_from_slice(CRLF);
    out.extend_from_slice(bytes);
    out.extend_from_slice(CRLF);
}

/// Appends one encoded command to `out`. The command name is upper-cased.
pub fn encode_command(out: &mut Vec<u8>, name: &str, args: &[Arg]) {
    let argc: usize = 1 + args.iter().map(Arg::count).sum::<usize>();
    out.push(b'*');
    out.extend_from_slice(argc.to_string().as_bytes());
    out.extend_from_slice(CRLF);
    write_bulk(out, name.to_ascii_uppercase().as_bytes());
    for arg in args {
        arg.write_to(out);
    }
}

/// Appends an encoded reply to `out`.
pub fn encode_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Nil => out.extend_from_slice(b"$-1\r\n"),
        Value::Okay => out.extend_from_slice(b"+OK\r\n"),
        Value::Status(s) => {
            out.push(b'+');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(CRLF);
        }
        Value::Error(msg) => {
            out.push(b'-');
            out.extend_from_slice(msg.as_bytes());
            out.extend_from_slice(CRLF);
        }
        Value::Int(n) => {
            out.push(b':');
            out.extend_from_slice(n.to_string().as_bytes());
            out.extend_from_slice(CRLF);
        }
        Value::Bulk(bytes) => write_bulk(out, bytes),
        Value::Array(items) => {
            out.push(b'*');
            out.extend_from_slice(items.len().to_string().as_bytes());
            out.extend_from_slice(CRLF);
            for item in items {
                encode_value(out, item);
            }
        }
    }
}

/// Attempts to decode one value from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete value, or the
/// value together with the number of bytes it occupied.
pub fn decode(buf: &[u8]) -> Result<Option<(Value, usize)>, String> {
    decode_at(buf, 0)
}

fn decode_at(buf: &[u8], start: usize) -> Result<Option<(Value, usize)>, String> {
    let Some((line, next)) = read_line(buf, start) else {
        return Ok(None);
    };
    let Some((&tag, rest)) = line.split_first() else {
        return Err("empty reply header".to_string());
    };
    let text = std::str::from_utf8(rest).map_err(|_| "reply header is not UTF-8".to_string())?;

    match tag {
        b'+' => {
            let value = if text.eq_ignore_ascii_case("OK") {
                Value::Okay
            } else {
                Value::Status(text.to_string())
            };
            Ok(Some((value, next)))
        }
        b'-' => Ok(Some((Value::Error(text.to_string()), next))),
        b':' => {
            let n = parse_len(text)?;
            Ok(Some((Value::Int(n), next)))
        }
        b'$' => {
            let size = parse_len(text)?;
            if size < 0 {
                return Ok(Some((Value::Nil, next)));
            }
            if size > MAX_BULK_LEN {
                return Err(format!("bulk string length {} exceeds the limit", size));
            }
            let size = size as usize;
            let end = next + size;
            if buf.len() < end + CRLF.len() {
                return Ok(None);
            }
            if &buf[end..end + CRLF.len()] != CRLF {
                return Err(format!("bulk string of {} bytes is not terminated", size));
            }
            Ok(Some((Value::Bulk(buf[next..end].to_vec()), end + CRLF.len())))
        }
        b'*' => {
            let size = parse_len(text)?;
            if size < 0 {
                return Ok(Some((Value::Nil, next)));
            }
            if size > MAX_ARRAY_LEN {
                return Err(format!("array length {} exceeds the limit", size));
            }
            let mut items = Vec::with_capacity((size as usize).min(ARRAY_PREALLOC));
            let mut pos = next;
            for _ in 0..size {
                match decode_at(buf, pos)? {
                    Some((item, after)) => {
                        items.push(item);
                        pos = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Value::Array(items), pos)))
        }
        other => Err(format!(
            "undefined reply type '{}' in '{}'",
            other as char,
            String::from_utf8_lossy(line)
        )),
    }
}

/// Finds the line starting at `start`; returns it without its terminator and
/// the offset just after the terminator.
fn read_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let newline = buf[start..].iter().position(|&b| b == b'\n')? + start;
    let line = &buf[start..newline];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Some((line, newline + 1))
}

fn parse_len(text: &str) -> Result<i64, String> {
    text.trim()
        .parse()
        .map_err(|_| format!("invalid length or integer '{}'", text))
}
