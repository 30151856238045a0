//! # JSON Payloads
//!
//! Request and reply payloads are flat JSON objects. This module reads them
//! without copying ([`Document`] is a validated view into the receive buffer)
//! and writes them into any `core::fmt::Write` sink, typically a
//! `heapless::String`.
//!
//! Strings without escape sequences are borrowed as [`Value::Str`]. Strings
//! that contain escapes stay encoded as [`Value::Escaped`]: they are written
//! back out unchanged and decoded on demand with [`Value::unescape`].

use core::fmt::Write;

use serde::ser::{Error as _, Serialize, Serializer};

use crate::error::PayloadError;

/// Objects and arrays nested deeper than this are rejected.
pub const MAX_DEPTH: usize = 16;

/// Longest escaped string that can be re-encoded through `serde`.
pub const MAX_UNESCAPED_LEN: usize = 256;

/// A JSON value borrowed from a payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'a> {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// A string that needs no escaping.
    Str(&'a str),
    /// String contents as they appeared in the payload, escapes intact.
    Escaped(&'a str),
    Object(Document<'a>),
    /// Raw array text, brackets included.
    Array(&'a str),
}

impl<'a> Value<'a> {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numbers of either kind as `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// The string, if it is one and holds no escape sequences.
    pub fn as_str(&self) -> Option<&'a str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Decodes a string of either kind into an owned buffer.
    ///
    /// Returns `None` for non-strings and for text longer than `N` bytes.
    pub fn unescape<const N: usize>(&self) -> Option<heapless::String<N>> {
        let mut out = heapless::String::new();
        match self {
            Value::Str(s) => out.push_str(s).ok()?,
            Value::Escaped(raw) => {
                for c in Unescape::new(raw) {
                    out.push(c).ok()?;
                }
            }
            _ => return None,
        }
        Some(out)
    }

    /// The elements of an array.
    pub fn items(&self) -> Option<Items<'a>> {
        match self {
            Value::Array(raw) => Some(Items::new(raw)),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<Document<'a>> {
        match self {
            Value::Object(doc) => Some(*doc),
            _ => None,
        }
    }
}

impl From<bool> for Value<'_> {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value<'_> {
    fn from(i: i32) -> Self {
        Value::Int(i.into())
    }
}

impl From<u32> for Value<'_> {
    fn from(i: u32) -> Self {
        Value::Int(i.into())
    }
}

impl From<i64> for Value<'_> {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f32> for Value<'_> {
    fn from(f: f32) -> Self {
        Value::Float(f.into())
    }
}

impl From<f64> for Value<'_> {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl<'a> From<&'a str> for Value<'a> {
    fn from(s: &'a str) -> Self {
        Value::Str(s)
    }
}

impl<'a> From<Document<'a>> for Value<'a> {
    fn from(doc: Document<'a>) -> Self {
        Value::Object(doc)
    }
}

/// A validated JSON object, borrowed from the text it was parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Document<'a> {
    raw: &'a str,
}

impl<'a> Document<'a> {
    /// Parses and validates a payload that must be a single JSON object.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, PayloadError> {
        let text = core::str::from_utf8(bytes).map_err(|_| PayloadError::InvalidUtf8)?;
        Self::parse_str(text)
    }

    pub fn parse_str(text: &'a str) -> Result<Self, PayloadError> {
        let mut scanner = Scanner::new(text);
        scanner.skip_ws();
        if scanner.peek() != Some(b'{') {
            return Err(PayloadError::Malformed);
        }
        let start = scanner.pos;
        scanner.object(0)?;
        let end = scanner.pos;
        scanner.skip_ws();
        if !scanner.at_end() {
            return Err(PayloadError::Malformed);
        }
        Ok(Document {
            raw: &text[start..end],
        })
    }

    /// The object's JSON text, braces included.
    pub fn as_str(&self) -> &'a str {
        self.raw
    }

    /// Entries in document order.
    pub fn iter(&self) -> Entries<'a> {
        let mut scanner = Scanner::new(self.raw);
        let done = scanner.expect(b'{').is_err();
        Entries {
            scanner,
            first: true,
            done,
        }
    }

    /// The value of the first entry named `key`.
    ///
    /// Keys are compared after decoding, so `"a\u0062"` matches `"ab"`.
    pub fn get(&self, key: &str) -> Option<Value<'a>> {
        self.iter().find(|(k, _)| key_eq(k, key)).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl<'a> IntoIterator for Document<'a> {
    type Item = (&'a str, Value<'a>);
    type IntoIter = Entries<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn key_eq(raw: &str, key: &str) -> bool {
    if raw.contains('\\') {
        Unescape::new(raw).eq(key.chars())
    } else {
        raw == key
    }
}

fn text_value(raw: &str) -> Value<'_> {
    if raw.contains('\\') {
        Value::Escaped(raw)
    } else {
        Value::Str(raw)
    }
}

/// Decodes the escape sequences of a validated JSON string body.
struct Unescape<'a> {
    chars: core::str::Chars<'a>,
}

impl<'a> Unescape<'a> {
    fn new(raw: &'a str) -> Self {
        Self { chars: raw.chars() }
    }

    fn hex4(&mut self) -> Option<u32> {
        (0..4).try_fold(0u32, |acc, _| Some(acc * 16 + self.chars.next()?.to_digit(16)?))
    }

    fn unicode(&mut self) -> char {
        let Some(unit) = self.hex4() else {
            return char::REPLACEMENT_CHARACTER;
        };
        if !(0xD800..0xDC00).contains(&unit) {
            return char::from_u32(unit).unwrap_or(char::REPLACEMENT_CHARACTER);
        }
        // high surrogate, the low half follows as another \uXXXX
        let rest = self.chars.as_str();
        if !rest.starts_with("\\u") {
            return char::REPLACEMENT_CHARACTER;
        }
        self.chars.nth(1);
        match self.hex4() {
            Some(low) if (0xDC00..0xE000).contains(&low) => {
                char::from_u32(0x10000 + ((unit - 0xD800) << 10) + (low - 0xDC00))
                    .unwrap_or(char::REPLACEMENT_CHARACTER)
            }
            _ => char::REPLACEMENT_CHARACTER,
        }
    }
}

impl Iterator for Unescape<'_> {
    type Item = char;

    fn next(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c != '\\' {
            return Some(c);
        }
        Some(match self.chars.next()? {
            'b' => '\u{8}',
            'f' => '\u{c}',
            'n' => '\n',
            'r' => '\r',
            't' => '\t',
            'u' => self.unicode(),
            other => other,
        })
    }
}

/// Iterator over the entries of a [`Document`].
pub struct Entries<'a> {
    scanner: Scanner<'a>,
    first: bool,
    done: bool,
}

impl<'a> Iterator for Entries<'a> {
    type Item = (&'a str, Value<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.scanner.entry(self.first) {
            Ok(Some(entry)) => {
                self.first = false;
                Some(entry)
            }
            _ => {
                self.done = true;
                None
            }
        }
    }
}

/// Iterator over the elements of an array [`Value`].
pub struct Items<'a> {
    scanner: Scanner<'a>,
    first: bool,
    done: bool,
}

impl<'a> Items<'a> {
    fn new(raw: &'a str) -> Self {
        let mut scanner = Scanner::new(raw);
        let done = scanner.expect(b'[').is_err();
        Self {
            scanner,
            first: true,
            done,
        }
    }
}

impl<'a> Iterator for Items<'a> {
    type Item = Value<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.scanner.element(self.first) {
            Ok(Some(value)) => {
                self.first = false;
                Some(value)
            }
            _ => {
                self.done = true;
                None
            }
        }
    }
}

struct Scanner<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), PayloadError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(PayloadError::Malformed)
        }
    }

    fn literal(&mut self, word: &str) -> Result<(), PayloadError> {
        let rest = self.text.as_bytes().get(self.pos..).unwrap_or_default();
        if rest.starts_with(word.as_bytes()) {
            self.pos += word.len();
            Ok(())
        } else {
            Err(PayloadError::Malformed)
        }
    }

    /// Reads one `"key": value` pair, or `None` at the closing brace.
    fn entry(&mut self, first: bool) -> Result<Option<(&'a str, Value<'a>)>, PayloadError> {
        self.skip_ws();
        match self.peek() {
            Some(b'}') => return Ok(None),
            Some(b',') if !first => {
                self.pos += 1;
                self.skip_ws();
            }
            _ if first => {}
            _ => return Err(PayloadError::Malformed),
        }
        let key = self.string()?;
        self.skip_ws();
        self.expect(b':')?;
        self.skip_ws();
        let value = self.value(1)?;
        Ok(Some((key, value)))
    }

    /// Reads one array element, or `None` at the closing bracket.
    fn element(&mut self, first: bool) -> Result<Option<Value<'a>>, PayloadError> {
        self.skip_ws();
        match self.peek() {
            Some(b']') => return Ok(None),
            Some(b',') if !first => {
                self.pos += 1;
                self.skip_ws();
            }
            _ if first => {}
            _ => return Err(PayloadError::Malformed),
        }
        self.value(1).map(Some)
    }

    fn string(&mut self) -> Result<&'a str, PayloadError> {
        self.expect(b'"')?;
        let start = self.pos;
        loop {
            match self.peek() {
                None => return Err(PayloadError::Malformed),
                Some(b'"') => {
                    let s = &self.text[start..self.pos];
                    self.pos += 1;
                    return Ok(s);
                }
                Some(b'\\') => self.pos += 2,
                Some(c) if c < 0x20 => return Err(PayloadError::Malformed),
                Some(_) => self.pos += 1,
            }
        }
    }

    fn number(&mut self) -> Result<Value<'a>, PayloadError> {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E')
        ) {
            self.pos += 1;
        }
        let text = &self.text[start..self.pos];
        let is_float = text.bytes().any(|b| matches!(b, b'.' | b'e' | b'E'));
        if !is_float {
            if let Ok(i) = text.parse::<i64>() {
                return Ok(Value::Int(i));
            }
        }
        text.parse::<f64>()
            .map(Value::Float)
            .map_err(|_| PayloadError::Malformed)
    }

    fn value(&mut self, depth: usize) -> Result<Value<'a>, PayloadError> {
        if depth > MAX_DEPTH {
            return Err(PayloadError::TooDeep);
        }
        let start = self.pos;
        match self.peek() {
            Some(b'"') => self.string().map(text_value),
            Some(b'{') => {
                self.object(depth)?;
                Ok(Value::Object(Document {
                    raw: &self.text[start..self.pos],
                }))
            }
            Some(b'[') => {
                self.array(depth)?;
                Ok(Value::Array(&self.text[start..self.pos]))
            }
            Some(b't') => self.literal("true").map(|_| Value::Bool(true)),
            Some(b'f') => self.literal("false").map(|_| Value::Bool(false)),
            Some(b'n') => self.literal("null").map(|_| Value::Null),
            Some(b'-' | b'0'..=b'9') => self.number(),
            _ => Err(PayloadError::Malformed),
        }
    }

    fn object(&mut self, depth: usize) -> Result<(), PayloadError> {
        self.expect(b'{')?;
        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(());
        }
        loop {
            self.skip_ws();
            self.string()?;
            self.skip_ws();
            self.expect(b':')?;
            self.skip_ws();
            self.value(depth + 1)?;
            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(());
                }
                _ => return Err(PayloadError::Malformed),
            }
        }
    }

    fn array(&mut self, depth: usize) -> Result<(), PayloadError> {
        self.expect(b'[')?;
        self.skip_ws();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(());
        }
        loop {
            self.skip_ws();
            self.value(depth + 1)?;
            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b']') => {
                    self.pos += 1;
                    return Ok(());
                }
                _ => return Err(PayloadError::Malformed),
            }
        }
    }
}

/// Incrementally writes one JSON object.
///
/// ```ignore
/// let mut out = heapless::String::<128>::new();
/// let mut w = ObjectWriter::begin(&mut out)?;
/// w.field("id", &Value::Int(1))?.field("method", &Value::Str("getCurrentTime"))?;
/// w.finish()?;
/// ```
pub struct ObjectWriter<'w, W: Write> {
    out: &'w mut W,
    first: bool,
}

impl<'w, W: Write> ObjectWriter<'w, W> {
    pub fn begin(out: &'w mut W) -> Result<Self, PayloadError> {
        out.write_char('{')?;
        Ok(Self { out, first: true })
    }

    fn key(&mut self, key: &str) -> Result<(), PayloadError> {
        if !self.first {
            self.out.write_char(',')?;
        }
        self.first = false;
        write_escaped(self.out, key)?;
        self.out.write_char(':')?;
        Ok(())
    }

    pub fn field(&mut self, key: &str, value: &Value<'_>) -> Result<&mut Self, PayloadError> {
        self.key(key)?;
        write_value(self.out, value)?;
        Ok(self)
    }

    /// Writes `key` with a nested object built from `fields`.
    pub fn object(&mut self, key: &str, fields: &[(&str, Value<'_>)]) -> Result<&mut Self, PayloadError> {
        self.key(key)?;
        write_object(self.out, fields)?;
        Ok(self)
    }

    pub fn finish(self) -> Result<(), PayloadError> {
        self.out.write_char('}')?;
        Ok(())
    }
}

/// Writes `fields` as one JSON object.
pub fn write_object<W: Write>(out: &mut W, fields: &[(&str, Value<'_>)]) -> Result<(), PayloadError> {
    let mut writer = ObjectWriter::begin(out)?;
    for (key, value) in fields {
        writer.field(key, value)?;
    }
    writer.finish()
}

fn write_value<W: Write>(out: &mut W, value: &Value<'_>) -> Result<(), PayloadError> {
    match value {
        Value::Null => out.write_str("null")?,
        Value::Bool(true) => out.write_str("true")?,
        Value::Bool(false) => out.write_str("false")?,
        Value::Int(i) => write!(out, "{}", i)?,
        // JSON has no NaN or infinity
        Value::Float(f) if !f.is_finite() => out.write_str("null")?,
        Value::Float(f) => write!(out, "{}", f)?,
        Value::Str(s) => write_escaped(out, s)?,
        Value::Escaped(raw) => write!(out, "\"{}\"", raw)?,
        Value::Object(doc) => out.write_str(doc.as_str())?,
        Value::Array(raw) => out.write_str(raw)?,
    }
    Ok(())
}

fn write_escaped<W: Write>(out: &mut W, s: &str) -> Result<(), PayloadError> {
    out.write_char('"')?;
    for c in s.chars() {
        match c {
            '"' => out.write_str("\\\"")?,
            '\\' => out.write_str("\\\\")?,
            '\n' => out.write_str("\\n")?,
            '\r' => out.write_str("\\r")?,
            '\t' => out.write_str("\\t")?,
            c if (c as u32) < 0x20 => write!(out, "\\u{:04x}", c as u32)?,
            c => out.write_char(c)?,
        }
    }
    out.write_char('"')?;
    Ok(())
}

impl Serialize for Value<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(b),
            Value::Int(i) => serializer.serialize_i64(i),
            Value::Float(f) if !f.is_finite() => serializer.serialize_unit(),
            Value::Float(f) => serializer.serialize_f64(f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Escaped(_) => {
                let text = self
                    .unescape::<MAX_UNESCAPED_LEN>()
                    .ok_or_else(|| S::Error::custom("string too long"))?;
                serializer.serialize_str(&text)
            }
            Value::Object(doc) => serializer.collect_map(doc.iter().map(|(k, v)| (text_value(k), v))),
            Value::Array(raw) => serializer.collect_seq(Items::new(raw)),
        }
    }
}
