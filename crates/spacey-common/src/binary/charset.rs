// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Charset resolution, encoding and streaming decoding

use crate::error::{CommonError, Result};
use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use encoding_rs::{CoderResult, Encoding};
use std::fmt;

/// A resolved character set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    /// UTF-8
    Utf8,
    /// UTF-16, little endian
    Utf16Le,
    /// UTF-16, big endian
    Utf16Be,
    /// 7-bit ASCII
    Ascii,
    /// ISO-8859-1, one byte per code point below 256
    Latin1,
    /// Bytes shown as base64 text
    Base64,
    /// Bytes shown as hexadecimal text
    Hex,
    /// Any other WHATWG encoding label
    Labeled(&'static Encoding),
}

impl Charset {
    /// Resolve a charset name.
    ///
    /// Names are matched case-insensitively with `-` and `_` ignored, so
    /// `UTF-8`, `utf8` and `Utf_8` are the same charset.
    pub fn parse(name: &str) -> Result<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .flat_map(char::to_lowercase)
            .collect();

        let charset = match normalized.as_str() {
            "utf8" => Charset::Utf8,
            "utf16" | "utf16le" | "ucs2" => Charset::Utf16Le,
            "utf16be" => Charset::Utf16Be,
            "ascii" | "usascii" => Charset::Ascii,
            "latin1" | "binary" | "iso88591" => Charset::Latin1,
            "base64" => Charset::Base64,
            "hex" => Charset::Hex,
            _ => Encoding::for_label(name.trim().as_bytes())
                .map(Charset::Labeled)
                .ok_or_else(|| CommonError::UnsupportedCharset(name.to_string()))?,
        };
        Ok(charset)
    }

    /// Whether converting between strings and bytes loses nothing.
    ///
    /// For the Unicode charsets `decode(encode(s)) == s` holds for every
    /// string. Base64 and hex render arbitrary bytes, so there
    /// `encode(decode(b)) == b` holds for every byte sequence instead.
    pub fn is_lossless(&self) -> bool {
        matches!(
            self,
            Charset::Utf8 | Charset::Utf16Le | Charset::Utf16Be | Charset::Base64 | Charset::Hex
        )
    }

    /// Encode a string into bytes.
    pub fn encode(&self, text: &str) -> Result<Vec<u8>> {
        let bytes = match self {
            Charset::Utf8 => text.as_bytes().to_vec(),
            Charset::Utf16Le => text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
            Charset::Utf16Be => text.encode_utf16().flat_map(u16::to_be_bytes).collect(),
            Charset::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
            Charset::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
            Charset::Base64 => BASE64_STANDARD
                .decode(text.trim())
                .map_err(|e| CommonError::argument(format!("invalid base64: {}", e)))?,
            Charset::Hex => hex::decode(text.trim())
                .map_err(|e| CommonError::argument(format!("invalid hex: {}", e)))?,
            Charset::Labeled(encoding) => {
                let (bytes, _, _) = encoding.encode(text);
                bytes.into_owned()
            }
        };
        Ok(bytes)
    }

    /// Decode a complete byte sequence into a string.
    pub fn decode(&self, bytes: &[u8]) -> String {
        let mut decoder = self.decoder();
        let mut text = decoder.write(bytes);
        text.push_str(&decoder.end());
        text
    }

    /// Create a streaming decoder for this charset.
    pub fn decoder(&self) -> Decoder {
        Decoder::new(*self)
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Charset::Utf8 => f.write_str("utf-8"),
            Charset::Utf16Le => f.write_str("utf-16le"),
            Charset::Utf16Be => f.write_str("utf-16be"),
            Charset::Ascii => f.write_str("us-ascii"),
            Charset::Latin1 => f.write_str("iso-8859-1"),
            Charset::Base64 => f.write_str("base64"),
            Charset::Hex => f.write_str("hex"),
            Charset::Labeled(encoding) => f.write_str(encoding.name()),
        }
    }
}

impl std::str::FromStr for Charset {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        Charset::parse(s)
    }
}

/// Streaming decoder for multi-block input
///
/// Bytes that end in the middle of a character are held back until the next
/// `write`, so splitting input at arbitrary block boundaries never corrupts
/// the decoded text.
pub struct Decoder {
    charset: Charset,
    inner: Option<encoding_rs::Decoder>,
    pending: Vec<u8>,
}

impl Decoder {
    /// Create a decoder for `charset`
    pub fn new(charset: Charset) -> Self {
        let inner = match charset {
            Charset::Utf8 => Some(encoding_rs::UTF_8.new_decoder_without_bom_handling()),
            Charset::Utf16Le => Some(encoding_rs::UTF_16LE.new_decoder_without_bom_handling()),
            Charset::Utf16Be => Some(encoding_rs::UTF_16BE.new_decoder_without_bom_handling()),
            Charset::Labeled(encoding) => Some(encoding.new_decoder_without_bom_handling()),
            _ => None,
        };
        Self {
            charset,
            inner,
            pending: Vec::new(),
        }
    }

    /// The charset being decoded
    pub fn charset(&self) -> Charset {
        self.charset
    }

    /// Decode the next block of bytes
    pub fn write(&mut self, buf: &[u8]) -> String {
        if let Some(decoder) = self.inner.as_mut() {
            return decode_with(decoder, buf, false);
        }
        match self.charset {
            Charset::Ascii => buf
                .iter()
                .map(|&b| if b.is_ascii() { b as char } else { char::REPLACEMENT_CHARACTER })
                .collect(),
            Charset::Latin1 => buf.iter().map(|&b| b as char).collect(),
            Charset::Base64 => self.encode_base64(buf),
            Charset::Hex => hex::encode(buf),
            _ => String::new(),
        }
    }

    /// Finish decoding, flushing anything still held back.
    ///
    /// A truncated trailing sequence decodes to U+FFFD. The decoder can be
    /// reused afterwards.
    pub fn end(&mut self) -> String {
        if let Some(decoder) = self.inner.as_mut() {
            let text = decode_with(decoder, &[], true);
            *self = Decoder::new(self.charset);
            return text;
        }
        // Only base64 holds bytes back: a partial group gets padded here
        let rest = std::mem::take(&mut self.pending);
        if rest.is_empty() {
            return String::new();
        }
        BASE64_STANDARD.encode(&rest)
    }

    fn encode_base64(&mut self, buf: &[u8]) -> String {
        self.pending.extend_from_slice(buf);

        // Base64 renders 3 bytes at a time; padding only belongs at the end
        let usable = (self.pending.len() / 3) * 3;
        if usable == 0 {
            return String::new();
        }

        let group: Vec<u8> = self.pending.drain(..usable).collect();
        BASE64_STANDARD.encode(&group)
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decoder")
            .field("charset", &self.charset)
            .field("pending", &self.pending.len())
            .finish()
    }
}

fn decode_with(decoder: &mut encoding_rs::Decoder, mut src: &[u8], last: bool) -> String {
    let capacity = decoder
        .max_utf8_buffer_length(src.len())
        .unwrap_or(src.len() * 3 + 4);
    let mut out = String::with_capacity(capacity);
    loop {
        let (result, read, _) = decoder.decode_to_string(src, &mut out, last);
        src = &src[read..];
        match result {
            CoderResult::InputEmpty => return out,
            CoderResult::OutputFull => out.reserve(src.len() * 3 + 4),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes_names() {
        assert_eq!(Charset::parse("UTF-8").unwrap(), Charset::Utf8);
        assert_eq!(Charset::parse("utf8").unwrap(), Charset::Utf8);
        assert_eq!(Charset::parse("US-ASCII").unwrap(), Charset::Ascii);
        assert_eq!(Charset::parse("utf-16").unwrap(), Charset::Utf16Le);
        assert_eq!(Charset::parse("ISO-8859-1").unwrap(), Charset::Latin1);
        assert!(matches!(
            Charset::parse("shift_jis").unwrap(),
            Charset::Labeled(_)
        ));
        assert!(matches!(
            Charset::parse("klingon"),
            Err(CommonError::UnsupportedCharset(_))
        ));
    }

    #[test]
    fn test_lossless_round_trip() {
        let samples = ["", "hello", "grüße, 世界", "emoji 🦀 and \r\n newlines"];
        for charset in [Charset::Utf8, Charset::Utf16Le, Charset::Utf16Be] {
            assert!(charset.is_lossless());
            for sample in samples {
                let bytes = charset.encode(sample).unwrap();
                assert_eq!(charset.decode(&bytes), sample, "{} {:?}", charset, sample);
            }
        }
    }

    #[test]
    fn test_utf8_split_multibyte() {
        let mut decoder = Charset::Utf8.decoder();
        // UTF-8 for "é" is [0xC3, 0xA9]
        assert_eq!(decoder.write(&[0xC3]), "");
        assert_eq!(decoder.write(&[0xA9]), "é");
        assert_eq!(decoder.end(), "");
    }

    #[test]
    fn test_truncated_sequence_flushes_replacement() {
        let mut decoder = Charset::Utf8.decoder();
        assert_eq!(decoder.write(&[b'a', 0xE4, 0xB8]), "a");
        assert_eq!(decoder.end(), "\u{FFFD}");
    }

    #[test]
    fn test_utf16_split_code_unit() {
        let mut decoder = Charset::Utf16Le.decoder();
        assert_eq!(decoder.write(&[b'h']), "");
        assert_eq!(decoder.write(&[0, b'i', 0]), "hi");
    }

    #[test]
    fn test_ascii_and_latin1() {
        assert_eq!(Charset::Ascii.encode("héllo").unwrap(), b"h?llo");
        assert_eq!(Charset::Ascii.decode(&[b'a', 0xFF]), "a\u{FFFD}");
        assert_eq!(Charset::Latin1.encode("é").unwrap(), vec![0xE9]);
        assert_eq!(Charset::Latin1.decode(&[0xE9]), "é");
    }

    #[test]
    fn test_base64_and_hex() {
        assert_eq!(Charset::Base64.encode("aGk=").unwrap(), b"hi");
        assert_eq!(Charset::Hex.encode("deadbeef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(Charset::Hex.encode("xyz").is_err());

        assert_eq!(Charset::Hex.decode(&[0xde, 0xad, 0xbe, 0xef]), "deadbeef");
        assert_eq!(Charset::Base64.decode(b"hi"), "aGk=");
    }

    #[test]
    fn test_base64_and_hex_round_trip() {
        let samples: [&[u8]; 4] = [b"", b"h", b"hello world", &[0x00, 0xff, 0x80, 0x7f, 0x10]];
        for charset in [Charset::Base64, Charset::Hex] {
            assert!(charset.is_lossless());
            for sample in samples {
                let text = charset.decode(sample);
                assert_eq!(charset.encode(&text).unwrap(), sample, "{} {:?}", charset, sample);
            }
        }
    }

    #[test]
    fn test_base64_streaming_holds_partial_groups() {
        let mut decoder = Charset::Base64.decoder();
        assert_eq!(decoder.write(b"he"), "");
        assert_eq!(decoder.write(b"llo"), "aGVs");
        assert_eq!(decoder.write(b"!"), "bG8h");
        assert_eq!(decoder.write(b"?"), "");
        assert_eq!(decoder.end(), "Pw==");
        assert_eq!(decoder.end(), "");

        let mut decoder = Charset::Hex.decoder();
        assert_eq!(decoder.write(&[0x0a]), "0a");
        assert_eq!(decoder.write(&[0xbc, 0xde]), "bcde");
        assert_eq!(decoder.end(), "");
    }
}
