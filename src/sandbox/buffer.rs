//! The byte-buffer global

use crate::kernel::protocol;

/// Text encodings a buffer converts to and from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Base64,
    Hex,
    Latin1,
}

impl Encoding {
    /// Parse an encoding name; `None` for unknown names
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Some(Encoding::Utf8),
            "base64" => Some(Encoding::Base64),
            "hex" => Some(Encoding::Hex),
            "latin1" | "binary" | "ascii" => Some(Encoding::Latin1),
            _ => None,
        }
    }
}

/// An owned, growable byte sequence
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Buffer {
    bytes: Vec<u8>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero-filled buffer of `len` bytes
    pub fn alloc(len: usize) -> Self {
        Self {
            bytes: vec![0; len],
        }
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Decode `text` from `encoding`
    pub fn from_str(text: &str, encoding: Encoding) -> Result<Self, String> {
        let bytes = match encoding {
            Encoding::Utf8 => text.as_bytes().to_vec(),
            Encoding::Base64 => protocol::decode_base64(text)?,
            Encoding::Hex => hex::decode(text).map_err(|e| format!("invalid hex: {}", e))?,
            // Code points above 0xff keep only their low byte
            Encoding::Latin1 => text.chars().map(|c| (c as u32 & 0xff) as u8).collect(),
        };
        Ok(Self { bytes })
    }

    /// Encode the contents as text. Invalid UTF-8 becomes U+FFFD.
    pub fn to_string(&self, encoding: Encoding) -> String {
        match encoding {
            Encoding::Utf8 => String::from_utf8_lossy(&self.bytes).into_owned(),
            Encoding::Base64 => protocol::encode_base64(&self.bytes),
            Encoding::Hex => self.to_hex(),
            Encoding::Latin1 => self.bytes.iter().map(|b| *b as char).collect(),
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Join buffers end to end
    pub fn concat(parts: &[Buffer]) -> Self {
        let total = parts.iter().map(Buffer::len).sum();
        let mut bytes = Vec::with_capacity(total);
        for part in parts {
            bytes.extend_from_slice(&part.bytes);
        }
        Self { bytes }
    }

    /// Copy of `[start, end)`; negative indices count from the end, and
    /// out-of-range bounds are clamped
    pub fn slice(&self, start: isize, end: Option<isize>) -> Self {
        let len = self.bytes.len() as isize;
        let clamp = |i: isize| -> usize {
            let i = if i < 0 { len + i } else { i };
            i.clamp(0, len) as usize
        };
        let start = clamp(start);
        let end = clamp(end.unwrap_or(len));
        if start >= end {
            return Self::new();
        }
        Self {
            bytes: self.bytes[start..end].to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl From<&[u8]> for Buffer {
    fn from(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }
}

impl From<&str> for Buffer {
    fn from(text: &str) -> Self {
        Self {
            bytes: text.as_bytes().to_vec(),
        }
    }
}

impl From<String> for Buffer {
    fn from(text: String) -> Self {
        Self {
            bytes: text.into_bytes(),
        }
    }
}

/// The `buffer` built-in
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferModule;

impl BufferModule {
    pub fn from(&self, text: &str, encoding: &str) -> Result<Buffer, String> {
        let encoding =
            Encoding::parse(encoding).ok_or_else(|| format!("Unknown encoding: {}", encoding))?;
        Buffer::from_str(text, encoding)
    }

    pub fn alloc(&self, len: usize) -> Buffer {
        Buffer::alloc(len)
    }

    pub fn concat(&self, parts: &[Buffer]) -> Buffer {
        Buffer::concat(parts)
    }

    /// Encoded length of `text` in bytes
    pub fn byte_length(&self, text: &str, encoding: Encoding) -> Result<usize, String> {
        Buffer::from_str(text, encoding).map(|b| b.len())
    }
}
