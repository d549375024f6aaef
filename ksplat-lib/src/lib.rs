pub mod bucket;
pub mod common;
pub mod compressed_ply;
pub mod compressor;
pub mod error;
pub mod ply;
pub mod sort;
pub mod sort_engine;
pub mod splat_buffer;
pub mod structures;

use std::io::{Cursor, Write};

use common::alpha_to_logit;
use common::u8_to_sh_dc;
use tracing::{debug, info};
use zstd::stream::{decode_all, Encoder};

pub use compressor::{encode, EncodeOptions, SectionOptions};
pub use error::{KsplatError, Result, SortError};
pub use ply::parse_splats;
pub use sort::{DepthMode, RequestOutcome, SortConfig, SortView, SortedSplats};
pub use sort_engine::{SortEngine, SortResponse};
pub use splat_buffer::{PrecomputedSplats, SplatBuffer};
pub use structures::{CompressionLevel, Splat, UncompressedSplatArray};

/// Little-endian zstd frame magic `0xFD2FB528`.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Smallest scale written to PLY, keeps `ln` finite for degenerate splats.
const MIN_PLY_SCALE: f32 = 1.0e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZstdOptions {
    pub level: u32,
    pub workers: u32,
}

/// True when `data` starts with a zstd frame.
#[inline]
pub fn is_zstd(data: &[u8]) -> bool {
    data.starts_with(&ZSTD_MAGIC)
}

#[inline(never)]
pub fn compress_zstd(data: &[u8], level: u32, workers: u32) -> Result<Vec<u8>> {
    let mut encoder = Encoder::new(Vec::new(), level as i32)
        .map_err(|e| KsplatError::ZstdCompress(format!("Encoder creation failed: {}", e)))?;
    encoder
        .multithread(workers)
        .map_err(|e| KsplatError::ZstdCompress(format!("Setting multithread failed: {}", e)))?;
    encoder
        .write_all(data)
        .map_err(|e| KsplatError::ZstdCompress(format!("Writing data failed: {}", e)))?;

    encoder
        .finish()
        .map_err(|e| KsplatError::ZstdCompress(format!("Finalizing compression failed: {}", e)))
}

#[inline(never)]
pub fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    decode_all(Cursor::new(data))
        .map_err(|e| KsplatError::ZstdDecompress(format!("Decompression failed: {}", e)))
}

/// Parses a PLY file and encodes it as a single-section splat buffer.
pub fn encode_ply(raw_data: &[u8], options: &EncodeOptions) -> Result<Vec<u8>> {
    let splats = parse_splats(raw_data)?;
    let buffer = encode(&[splats], options)?;
    Ok(buffer.into_bytes())
}

/// Loads a splat buffer, unwrapping a zstd frame first when present.
pub fn load_splat_buffer(data: &[u8]) -> Result<SplatBuffer> {
    if is_zstd(data) {
        debug!(compressed = data.len(), "unwrapping zstd frame");
        SplatBuffer::from_bytes(decompress_zstd(data)?)
    } else {
        SplatBuffer::from_bytes(data.to_vec())
    }
}

/// Decodes a splat buffer (optionally zstd-wrapped) into a float PLY.
pub fn decode_to_ply(data: &[u8], output: &mut Vec<u8>) -> Result<()> {
    let buffer = load_splat_buffer(data)?;
    write_ply(output, &buffer)
}

/// Writes every valid splat of `splats` as a binary little-endian float PLY.
pub fn write_ply(output: &mut Vec<u8>, splats: &SplatBuffer) -> Result<()> {
    let num_points = splats.valid_splat_count();

    output.clear();
    output.extend_from_slice(b"ply\nformat binary_little_endian 1.0\n");
    writeln!(output, "element vertex {}", num_points)?;
    output.extend_from_slice(b"property float x\nproperty float y\nproperty float z\n");
    output.extend_from_slice(
        b"property float f_dc_0\nproperty float f_dc_1\nproperty float f_dc_2\n",
    );
    output.extend_from_slice(
        b"property float opacity\n\
          property float scale_0\nproperty float scale_1\nproperty float scale_2\n\
          property float rot_0\nproperty float rot_1\nproperty float rot_2\nproperty float rot_3\n\
          end_header\n",
    );

    let point_size = (3 + 3 + 1 + 3 + 4) * 4;
    output.reserve(num_points * point_size);

    for i in (0..splats.vertex_count()).filter(|&i| splats.is_valid(i)) {
        let splat = splats.get_splat(i);

        output.extend_from_slice(bytemuck::cast_slice(&splat.center));

        let [r, g, b, a] = splat.color;
        let sh_dc = [u8_to_sh_dc(r), u8_to_sh_dc(g), u8_to_sh_dc(b)];
        output.extend_from_slice(bytemuck::cast_slice(&sh_dc));
        output.extend_from_slice(bytemuck::bytes_of(&alpha_to_logit(a)));

        let log_scale = splat.scale.map(|s| s.max(MIN_PLY_SCALE).ln());
        output.extend_from_slice(bytemuck::cast_slice(&log_scale));

        // (w, x, y, z) matches rot_0..rot_3
        output.extend_from_slice(bytemuck::cast_slice(&splat.rotation));
    }
    info!(points = num_points, bytes = output.len(), "wrote PLY");
    Ok(())
}

cfg_if::cfg_if! {
if #[cfg(feature = "async")] {
    use async_compression::zstd::CParameter;
    use async_compression::Level;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use async_compression::tokio::bufread::ZstdDecoder;
    use async_compression::tokio::write::ZstdEncoder;
    use tokio::io::BufReader;

    #[inline(never)]
    pub async fn compress_zstd_async(
        data: &[u8],
        level: u32,
        workers: u32,
    ) -> Result<Vec<u8>> {
        let mut compressed = Vec::new();
        let params = &[CParameter::nb_workers(workers)];
        let mut encoder = ZstdEncoder::with_quality_and_params(
            &mut compressed,
            Level::Precise(level as i32),
            params,
        );

        encoder.write_all(data)
            .await
            .map_err(|e| KsplatError::ZstdCompress(e.to_string()))?;

        encoder.shutdown()
            .await
            .map_err(|e| KsplatError::ZstdCompress(e.to_string()))?;

        Ok(compressed)
    }

    #[inline(never)]
    pub async fn decompress_zstd_async(data: &[u8]) -> Result<Vec<u8>> {
        let cursor = Cursor::new(data);
        let reader = BufReader::new(cursor);
        let mut decoder = ZstdDecoder::new(reader);
        let mut decompressed = Vec::new();

        decoder.read_to_end(&mut decompressed)
            .await
            .map_err(|e| KsplatError::ZstdDecompress(e.to_string()))?;

        Ok(decompressed)
    }

    /// [`encode_ply`] followed by an optional asynchronous zstd pass.
    #[inline(never)]
    pub async fn encode_ply_async(
        raw_data: &[u8],
        options: &EncodeOptions,
        zstd: Option<ZstdOptions>,
        output: &mut Vec<u8>,
    ) -> Result<()> {
        let encoded = encode_ply(raw_data, options)?;
        let encoded = match zstd {
            Some(z) => compress_zstd_async(&encoded, z.level, z.workers).await?,
            None => encoded,
        };
        output.clear();
        output.extend_from_slice(&encoded);
        Ok(())
    }

    #[inline(never)]
    pub async fn decode_to_ply_async(data: &[u8], output: &mut Vec<u8>) -> Result<()> {
        let buffer = if is_zstd(data) {
            SplatBuffer::from_bytes(decompress_zstd_async(data).await?)?
        } else {
            SplatBuffer::from_bytes(data.to_vec())?
        };
        write_ply(output, &buffer)
    }
}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ply::tests::create_test_ply;

    #[rustfmt::skip]
    const ROWS: [[f32; 14]; 3] = [
        // x, y, z, log scale, rot (w, x, y, z), opacity logit, f_dc
        [0.0, 0.1, 0.2, -1.0, -2.0, -3.0, 1.0, 0.0, 0.0, 0.0, 2.0, 0.2, 0.3, 0.4],
        [1.5, -0.5, 2.0, 0.5, 0.0, -0.5, 0.0, 1.0, 0.0, 0.0, 0.0, -0.4, 0.0, 1.0],
        // fully transparent, dropped by the default alpha filter
        [3.0, 3.0, 3.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, -30.0, 0.0, 0.0, 0.0],
    ];

    fn validate_output_ply(out_ply: &[u8], points: usize) {
        let text = String::from_utf8_lossy(out_ply);
        assert!(
            text.contains(&format!("element vertex {}\n", points)),
            "Output .ply missing 'element vertex {}'",
            points
        );
    }

    #[test]
    fn test_encode_decode_ply() {
        let raw_ply = create_test_ply(&ROWS);
        let options = EncodeOptions {
            compression_level: 0,
            ..Default::default()
        };

        let encoded = encode_ply(&raw_ply, &options).expect("encode_ply(...) failed");
        let mut out_ply = Vec::new();
        decode_to_ply(&encoded, &mut out_ply).expect("decode_to_ply(...) failed");
        validate_output_ply(&out_ply, 2);

        // the written PLY parses back to the same splats
        let original = parse_splats(&raw_ply).unwrap();
        let mut reparsed: Vec<Splat> = parse_splats(&out_ply).unwrap().iter().collect();
        reparsed.sort_by(|a, b| a.center[0].total_cmp(&b.center[0]));
        for (got, want) in reparsed.iter().zip(original.iter().take(2)) {
            assert_eq!(got.center, want.center);
            assert_eq!(got.color, want.color);
            for k in 0..3 {
                assert!((got.scale[k] - want.scale[k]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_zstd_wrapped_buffer_is_detected() {
        let raw_ply = create_test_ply(&ROWS);
        let encoded = encode_ply(&raw_ply, &EncodeOptions::default()).unwrap();
        assert!(!is_zstd(&encoded));

        let wrapped = compress_zstd(&encoded, 3, 1).unwrap();
        assert!(is_zstd(&wrapped));
        assert_eq!(decompress_zstd(&wrapped).unwrap(), encoded);

        let mut from_plain = Vec::new();
        let mut from_wrapped = Vec::new();
        decode_to_ply(&encoded, &mut from_plain).unwrap();
        decode_to_ply(&wrapped, &mut from_wrapped).unwrap();
        assert_eq!(from_plain, from_wrapped);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut out = Vec::new();
        assert!(decode_to_ply(b"definitely not a splat buffer", &mut out).is_err());
        assert!(matches!(
            encode_ply(b"ply\nformat ascii 1.0\nend_header\n", &EncodeOptions::default()),
            Err(KsplatError::UnsupportedEncoding(_))
        ));
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn test_encode_decode_async() {
        let raw_ply = create_test_ply(&ROWS);
        let zstd = ZstdOptions {
            level: 3,
            workers: 1,
        };

        let mut encoded = Vec::new();
        encode_ply_async(&raw_ply, &EncodeOptions::default(), Some(zstd), &mut encoded)
            .await
            .expect("encode_ply_async failed");
        assert!(is_zstd(&encoded));

        let mut out_ply = Vec::new();
        decode_to_ply_async(&encoded, &mut out_ply)
            .await
            .expect("decode_to_ply_async failed");
        validate_output_ply(&out_ply, 2);

        let mut sync_ply = Vec::new();
        decode_to_ply(&encoded, &mut sync_ply).unwrap();
        assert_eq!(out_ply, sync_ply);
    }
}
