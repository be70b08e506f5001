//! Content-type sniffing from the first bytes of a stream.
//!
//! Classification follows the byte-signature rules browsers use for MIME
//! sniffing: known magic numbers first, then a text/binary split.

use crate::services::object_store::ByteStream;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::ReaderStream;

/// Number of leading bytes inspected.
pub const SNIFF_LEN: usize = 512;

pub const OCTET_STREAM: &str = "application/octet-stream";

const TEXT_PLAIN_UTF8: &str = "text/plain; charset=utf-8";

/// Bytes consumed while sniffing plus the resulting classification.
#[derive(Debug, Clone)]
pub struct Sniffed {
    pub content_type: String,
    pub prefix: Bytes,
}

/// Returns `ct` unless it is empty or carries control characters, in which
/// case the generic binary type is used instead.
pub fn safe_content_type(ct: &str) -> String {
    let ct = ct.trim();
    if ct.is_empty() || ct.chars().any(|c| c.is_control()) {
        OCTET_STREAM.to_string()
    } else {
        ct.to_string()
    }
}

/// Classify a byte prefix. Only the first `SNIFF_LEN` bytes are considered.
pub fn detect_content_type(data: &[u8]) -> &'static str {
    let data = &data[..data.len().min(SNIFF_LEN)];

    if let Some(ct) = sniff_markup(data) {
        return ct;
    }
    for &(signature, ct) in EXACT_SIGNATURES {
        if data.starts_with(signature) {
            return ct;
        }
    }
    if let Some(ct) = sniff_riff(data).or_else(|| sniff_mp4(data)) {
        return ct;
    }
    if data.iter().any(|&b| is_binary_byte(b)) {
        OCTET_STREAM
    } else {
        TEXT_PLAIN_UTF8
    }
}

/// Read up to `SNIFF_LEN` bytes from `reader` and classify them.
pub async fn sniff_reader<R>(reader: &mut R) -> std::io::Result<Sniffed>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < SNIFF_LEN {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);

    Ok(Sniffed {
        content_type: safe_content_type(detect_content_type(&buf)),
        prefix: Bytes::from(buf),
    })
}

/// Re-attach the sniffed prefix in front of the rest of `reader`.
pub fn rejoin<R>(prefix: Bytes, reader: R) -> ByteStream
where
    R: AsyncRead + Send + 'static,
{
    let head = futures::stream::once(async move { Ok(prefix) });
    let rest = ReaderStream::new(reader);
    Box::pin(head.chain(rest).filter(|chunk| {
        let keep = !matches!(chunk, Ok(bytes) if bytes.is_empty());
        async move { keep }
    }))
}

const EXACT_SIGNATURES: &[(&[u8], &str)] = &[
    (b"%PDF-", "application/pdf"),
    (b"%!PS-Adobe-", "application/postscript"),
    (b"\xFE\xFF", "text/plain; charset=utf-16be"),
    (b"\xFF\xFE", "text/plain; charset=utf-16le"),
    (b"\xEF\xBB\xBF", TEXT_PLAIN_UTF8),
    (b"\x00\x00\x01\x00", "image/x-icon"),
    (b"\x00\x00\x02\x00", "image/x-icon"),
    (b"BM", "image/bmp"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"\x89PNG\x0D\x0A\x1A\x0A", "image/png"),
    (b"\xFF\xD8\xFF", "image/jpeg"),
    (b"\x1A\x45\xDF\xA3", "video/webm"),
    (b"OggS\x00", "application/ogg"),
    (b"ID3", "audio/mpeg"),
    (b"\x00asm", "application/wasm"),
    (b"wOFF", "font/woff"),
    (b"wOF2", "font/woff2"),
    (b"OTTO", "font/otf"),
    (b"\x00\x01\x00\x00", "font/ttf"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x1F\x8B\x08", "application/x-gzip"),
    (b"Rar!\x1A\x07\x00", "application/x-rar-compressed"),
    (b"Rar!\x1A\x07\x01\x00", "application/x-rar-compressed"),
    (b"7z\xBC\xAF\x27\x1C", "application/x-7z-compressed"),
];

const HTML_TAGS: &[&[u8]] = &[
    b"<!DOCTYPE HTML",
    b"<HTML",
    b"<HEAD",
    b"<SCRIPT",
    b"<IFRAME",
    b"<H1",
    b"<DIV",
    b"<FONT",
    b"<TABLE",
    b"<A",
    b"<STYLE",
    b"<TITLE",
    b"<B",
    b"<BODY",
    b"<BR",
    b"<P",
    b"<!--",
];

/// HTML/XML detection: leading whitespace is skipped and tags compare
/// case-insensitively; an HTML tag must be followed by a space or `>`.
fn sniff_markup(data: &[u8]) -> Option<&'static str> {
    let start = data
        .iter()
        .position(|b| !matches!(b, b'\t' | b'\n' | 0x0C | b'\r' | b' '))?;
    let body = &data[start..];

    if body.starts_with(b"<?xml") {
        return Some("text/xml; charset=utf-8");
    }
    for tag in HTML_TAGS {
        if body.len() > tag.len()
            && body[..tag.len()].eq_ignore_ascii_case(tag)
            && matches!(body[tag.len()], b' ' | b'>')
        {
            return Some("text/html; charset=utf-8");
        }
    }
    None
}

fn sniff_riff(data: &[u8]) -> Option<&'static str> {
    if data.len() < 12 || !data.starts_with(b"RIFF") {
        return None;
    }
    match &data[8..12] {
        b"WAVE" => Some("audio/wave"),
        b"AVI " => Some("video/avi"),
        b"WEBP" if data.len() >= 14 && &data[12..14] == b"VP" => Some("image/webp"),
        _ => None,
    }
}

/// ISO base media file: a leading `ftyp` box with an `mp4` brand.
fn sniff_mp4(data: &[u8]) -> Option<&'static str> {
    if data.len() < 12 || &data[4..8] != b"ftyp" {
        return None;
    }
    let box_size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if box_size % 4 != 0 || box_size < 12 || data.len() < box_size {
        return None;
    }
    let mut offset = 8;
    while offset + 3 <= box_size {
        // skip the minor version field
        if offset != 12 && &data[offset..offset + 3] == b"mp4" {
            return Some("video/mp4");
        }
        offset += 4;
    }
    None
}

fn is_binary_byte(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::object_store::collect_stream;
    use std::io::Cursor;

    #[test]
    fn classifies_known_signatures() {
        assert_eq!(detect_content_type(b"%PDF-1.7 ..."), "application/pdf");
        assert_eq!(detect_content_type(b"\x89PNG\r\n\x1a\n rest"), "image/png");
        assert_eq!(detect_content_type(b"\xFF\xD8\xFF\xE0"), "image/jpeg");
        assert_eq!(detect_content_type(b"PK\x03\x04\x14\x00"), "application/zip");
        assert_eq!(detect_content_type(b"GIF89a.."), "image/gif");
        assert_eq!(
            detect_content_type(b"RIFF\x00\x00\x00\x00WEBPVP8 "),
            "image/webp"
        );
    }

    #[test]
    fn detects_markup_case_insensitively() {
        assert_eq!(
            detect_content_type(b"  \n<!doctype html><html>"),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            detect_content_type(b"<?xml version=\"1.0\"?><a/>"),
            "text/xml; charset=utf-8"
        );
        // `<Bx` is not a `<B` tag
        assert_eq!(detect_content_type(b"<Bx"), TEXT_PLAIN_UTF8);
    }

    #[test]
    fn splits_text_from_binary() {
        assert_eq!(detect_content_type(b"plain words\n"), TEXT_PLAIN_UTF8);
        assert_eq!(detect_content_type(b""), TEXT_PLAIN_UTF8);
        assert_eq!(detect_content_type(b"ab\x00cd"), OCTET_STREAM);
    }

    #[test]
    fn detects_mp4_brand() {
        let mut data = vec![0, 0, 0, 0x18];
        data.extend_from_slice(b"ftypisom\x00\x00\x02\x00isommp41");
        assert_eq!(detect_content_type(&data), "video/mp4");
    }

    #[test]
    fn control_characters_fall_back_to_binary() {
        assert_eq!(safe_content_type("text/html\r\nX-Evil: 1"), OCTET_STREAM);
        assert_eq!(safe_content_type(""), OCTET_STREAM);
        assert_eq!(safe_content_type("image/png"), "image/png");
    }

    #[tokio::test]
    async fn sniff_then_rejoin_preserves_every_byte() {
        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = Cursor::new(payload.clone());

        let sniffed = sniff_reader(&mut reader).await.unwrap();
        assert_eq!(sniffed.prefix.len(), SNIFF_LEN);
        assert_eq!(sniffed.content_type, OCTET_STREAM);

        let body = collect_stream(rejoin(sniffed.prefix, reader)).await.unwrap();
        assert_eq!(body, payload);
    }

    #[tokio::test]
    async fn short_input_is_sniffed_whole() {
        let mut reader = Cursor::new(b"hi".to_vec());
        let sniffed = sniff_reader(&mut reader).await.unwrap();
        assert_eq!(&sniffed.prefix[..], b"hi");
        let body = collect_stream(rejoin(sniffed.prefix, reader)).await.unwrap();
        assert_eq!(body, b"hi");
    }
}
