//! Payload encoding helpers.

use std::io::Write;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::write::ZlibEncoder;
use flate2::Compression;

/// zlib-compress `data` and base64-encode the result.
///
/// Used for the opaque parameter blobs carried inside slow-sample upload
/// payloads. The audit rendering of the same payload skips this step so
/// the parameters stay readable.
///
/// # Errors
///
/// Returns an error if compression fails.
pub fn compress_encode(data: &[u8]) -> std::io::Result<String> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    let compressed = encoder.finish()?;
    Ok(STANDARD.encode(compressed))
}
