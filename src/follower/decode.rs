//! Body decompression for the `http`/`http_length`/`http_chunked` states
//! (spec.md §4.3): `Content-Encoding: gzip` / `deflate`, else identity.

use std::io::Read;

use flate2::read::{GzDecoder, ZlibDecoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoder {
    Identity,
    Gzip,
    Deflate,
}

impl Decoder {
    /// Select a decoder from a `Content-Encoding` header value. Anything
    /// unrecognized falls back to identity with a warning (spec.md §4.3,
    /// §7 "protocol surprises").
    pub fn from_content_encoding(value: Option<&str>) -> Decoder {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            None => Decoder::Identity,
            Some(ref v) if v.is_empty() || v == "identity" => Decoder::Identity,
            Some(ref v) if v == "gzip" || v == "x-gzip" => Decoder::Gzip,
            Some(ref v) if v == "deflate" => Decoder::Deflate,
            Some(other) => {
                log::warn!("unknown content-encoding '{other}', falling back to identity");
                Decoder::Identity
            }
        }
    }

    /// Decode a complete body. On decode failure (truncated/corrupt stream)
    /// the raw bytes are returned unchanged and a warning is logged — a
    /// decode failure is a protocol surprise, not a connection-fatal error.
    pub fn decode(self, raw: &[u8]) -> Vec<u8> {
        match self {
            Decoder::Identity => raw.to_vec(),
            Decoder::Gzip => {
                let mut out = Vec::new();
                match GzDecoder::new(raw).read_to_end(&mut out) {
                    Ok(_) => out,
                    Err(e) => {
                        log::warn!("gzip decode failed: {e}, passing raw body through");
                        raw.to_vec()
                    }
                }
            }
            Decoder::Deflate => {
                let mut out = Vec::new();
                match ZlibDecoder::new(raw).read_to_end(&mut out) {
                    Ok(_) => out,
                    Err(e) => {
                        log::warn!("deflate decode failed: {e}, passing raw body through");
                        raw.to_vec()
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn identity_passes_through() {
        assert_eq!(Decoder::Identity.decode(b"hello"), b"hello");
    }

    #[test]
    fn gzip_round_trip() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"X").unwrap();
        let compressed = enc.finish().unwrap();
        assert_eq!(Decoder::Gzip.decode(&compressed), b"X");
    }

    #[test]
    fn unknown_encoding_falls_back_to_identity() {
        assert_eq!(Decoder::from_content_encoding(Some("br")), Decoder::Identity);
    }
}
