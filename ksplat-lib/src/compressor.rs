use tracing::{debug, info};
use zerocopy::byteorder::little_endian::{F32, U16, U32};
use zerocopy::IntoBytes;

use crate::bucket::{compute_buckets, DEFAULT_BLOCK_SIZE, DEFAULT_BUCKET_SIZE};
use crate::common::{float_to_half, normalize_quat};
use crate::error::{KsplatError, Result};
use crate::splat_buffer::SplatBuffer;
use crate::structures::{
    Bucket, CompressionLevel, SectionHeader, SplatBufferHeader, UncompressedSplatArray,
    HEADER_SIZE, INVALID_COLOR, SECTION_HEADER_SIZE,
};

pub const DEFAULT_COMPRESSION_LEVEL: u8 = 1;
pub const DEFAULT_MINIMUM_ALPHA: u32 = 1;
pub const DEFAULT_SCALE_RANGE: u32 = 32767;
pub const MAX_SCALE_RANGE: u32 = 32767;

/// Stored in place of a real splat color that would collide with [`INVALID_COLOR`].
const NUDGED_COLOR: [u8; 4] = [254, 0, 0, 0];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SectionOptions {
    pub block_size: f32,
    pub bucket_size: usize,
    pub scale_range: u32,
}

impl Default for SectionOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            bucket_size: DEFAULT_BUCKET_SIZE,
            scale_range: DEFAULT_SCALE_RANGE,
        }
    }
}

impl SectionOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.block_size.is_finite() && self.block_size > 0.0) {
            return Err(KsplatError::InvalidOptions(format!(
                "block size must be positive, got {}",
                self.block_size
            )));
        }
        if self.bucket_size == 0 || u32::try_from(self.bucket_size).is_err() {
            return Err(KsplatError::InvalidOptions(format!(
                "bucket size must be in 1..=u32::MAX, got {}",
                self.bucket_size
            )));
        }
        if !(1..=MAX_SCALE_RANGE).contains(&self.scale_range) {
            return Err(KsplatError::InvalidOptions(format!(
                "scale range must be in 1..={}, got {}",
                MAX_SCALE_RANGE, self.scale_range
            )));
        }
        Ok(())
    }

    /// Quantization steps per unit of distance from the bucket center.
    #[inline]
    pub fn compression_scale_factor(&self) -> f32 {
        compression_scale_factor(self.scale_range, self.block_size)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodeOptions {
    pub compression_level: u8,
    /// Splats with an 8-bit alpha below this value are dropped. 256 drops everything.
    pub minimum_alpha: u32,
    pub sections: SectionOptions,
    pub section_overrides: Vec<Option<SectionOptions>>,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            minimum_alpha: DEFAULT_MINIMUM_ALPHA,
            sections: SectionOptions::default(),
            section_overrides: Vec::new(),
        }
    }
}

impl EncodeOptions {
    pub fn with_section_override(mut self, section: usize, options: SectionOptions) -> Self {
        if self.section_overrides.len() <= section {
            self.section_overrides.resize(section + 1, None);
        }
        self.section_overrides[section] = Some(options);
        self
    }

    pub fn section_options(&self, section: usize) -> SectionOptions {
        self.section_overrides
            .get(section)
            .copied()
            .flatten()
            .unwrap_or(self.sections)
    }

    pub fn level(&self) -> Result<CompressionLevel> {
        CompressionLevel::from_level(self.compression_level).ok_or_else(|| {
            KsplatError::InvalidOptions(format!(
                "unsupported compression level {}",
                self.compression_level
            ))
        })
    }
}

#[inline]
pub fn compression_scale_factor(scale_range: u32, block_size: f32) -> f32 {
    scale_range as f32 / (block_size / 2.0)
}

/// Maps one coordinate to its stored integer relative to the bucket center.
#[inline]
pub fn quantize_coordinate(value: f32, center: f32, factor: f32, scale_range: u32) -> u16 {
    let q = ((value - center) * factor).round() + scale_range as f32;
    q.clamp(0.0, (2 * scale_range + 1) as f32) as u16
}

#[inline]
pub fn dequantize_coordinate(stored: u16, center: f32, factor: f32, scale_range: u32) -> f32 {
    center + (stored as f32 - scale_range as f32) / factor
}

fn filter_by_alpha(splats: &UncompressedSplatArray, minimum_alpha: u32) -> UncompressedSplatArray {
    let mut kept = UncompressedSplatArray::with_capacity(splats.splat_count());
    for splat in splats.iter().filter(|s| s.alpha() as u32 >= minimum_alpha) {
        kept.push(splat);
    }
    kept
}

#[derive(Default)]
struct SectionColumns {
    centers: Vec<u8>,
    scales: Vec<u8>,
    colors: Vec<u8>,
    rotations: Vec<u8>,
}

impl SectionColumns {
    fn with_slots(level: CompressionLevel, slots: usize) -> Self {
        Self {
            centers: Vec::with_capacity(slots * level.center_bytes()),
            scales: Vec::with_capacity(slots * level.scale_bytes()),
            colors: Vec::with_capacity(slots * level.color_bytes()),
            rotations: Vec::with_capacity(slots * level.rotation_bytes()),
        }
    }

    fn push_invalid(&mut self, level: CompressionLevel) {
        let len = self.centers.len();
        self.centers.resize(len + level.center_bytes(), 0);
        let len = self.scales.len();
        self.scales.resize(len + level.scale_bytes(), 0);
        let len = self.rotations.len();
        self.rotations.resize(len + level.rotation_bytes(), 0);
        self.colors.extend_from_slice(&INVALID_COLOR);
    }

    fn push_splat(
        &mut self,
        level: CompressionLevel,
        splats: &UncompressedSplatArray,
        index: usize,
        bucket: &Bucket,
        options: &SectionOptions,
    ) {
        let center = splats.centers[index];
        let scale = splats.scales[index];
        let rotation = normalize_quat(splats.rotations[index]);
        let color = match splats.colors[index] {
            INVALID_COLOR => NUDGED_COLOR,
            c => c,
        };

        match level {
            CompressionLevel::Lossless => {
                center
                    .iter()
                    .for_each(|v| self.centers.extend_from_slice(&v.to_le_bytes()));
                scale
                    .iter()
                    .for_each(|v| self.scales.extend_from_slice(&v.to_le_bytes()));
                rotation
                    .iter()
                    .for_each(|v| self.rotations.extend_from_slice(&v.to_le_bytes()));
            }
            CompressionLevel::Quantized => {
                let factor = options.compression_scale_factor();
                center.iter().zip(bucket.center.iter()).for_each(|(&p, &c)| {
                    let q = quantize_coordinate(p, c, factor, options.scale_range);
                    self.centers.extend_from_slice(&q.to_le_bytes());
                });
                scale.iter().for_each(|&v| {
                    self.scales.extend_from_slice(&float_to_half(v).to_le_bytes())
                });
                rotation.iter().for_each(|&v| {
                    self.rotations
                        .extend_from_slice(&float_to_half(v).to_le_bytes())
                });
            }
        }
        self.colors.extend_from_slice(&color);
    }
}

struct EncodedSection {
    header: SectionHeader,
    payload: Vec<u8>,
    valid: usize,
}

fn encode_section(
    splats: &UncompressedSplatArray,
    level: CompressionLevel,
    options: &SectionOptions,
) -> EncodedSection {
    let buckets = compute_buckets(splats, options.block_size, options.bucket_size);
    let slots = buckets.len() * options.bucket_size;

    let mut columns = SectionColumns::with_slots(level, slots);
    for bucket in &buckets {
        for &index in &bucket.indices {
            if UncompressedSplatArray::is_sentinel(index as usize) {
                columns.push_invalid(level);
            } else {
                columns.push_splat(level, splats, index as usize, bucket, options);
            }
        }
    }

    let bucket_table: Vec<u8> = match level {
        CompressionLevel::Lossless => Vec::new(),
        CompressionLevel::Quantized => buckets
            .iter()
            .flat_map(|b| b.center)
            .flat_map(f32::to_le_bytes)
            .collect(),
    };

    let SectionColumns {
        centers,
        scales,
        colors,
        rotations,
    } = columns;
    let mut payload = Vec::with_capacity(slots * level.bytes_per_splat() + bucket_table.len());
    payload.extend_from_slice(&centers);
    payload.extend_from_slice(&scales);
    payload.extend_from_slice(&colors);
    payload.extend_from_slice(&rotations);
    payload.extend_from_slice(&bucket_table);

    let header = SectionHeader {
        splat_count: U32::new(slots as u32),
        bucket_size: U32::new(options.bucket_size as u32),
        bucket_count: U32::new(buckets.len() as u32),
        block_size: F32::new(options.block_size),
        bucket_record_size: U16::new(level.bucket_record_size() as u16),
        scale_range: U32::new(options.scale_range),
    };
    debug!(
        slots,
        buckets = buckets.len(),
        payload_bytes = payload.len(),
        "encoded section"
    );
    EncodedSection {
        header,
        payload,
        valid: splats.splat_count(),
    }
}

/// Encodes one or more splat tables, one section each, into a [`SplatBuffer`].
pub fn encode(sections: &[UncompressedSplatArray], options: &EncodeOptions) -> Result<SplatBuffer> {
    let level = options.level()?;
    let section_count = u8::try_from(sections.len()).map_err(|_| {
        KsplatError::InvalidOptions(format!("too many sections: {}", sections.len()))
    })?;
    for i in 0..sections.len() {
        options.section_options(i).validate()?;
    }

    let filtered: Vec<UncompressedSplatArray> = sections
        .iter()
        .map(|s| filter_by_alpha(s, options.minimum_alpha))
        .collect();
    if filtered.iter().all(UncompressedSplatArray::is_empty) {
        return Err(KsplatError::NothingToEncode);
    }

    let encoded: Vec<EncodedSection> = filtered
        .iter()
        .enumerate()
        .map(|(i, s)| encode_section(s, level, &options.section_options(i)))
        .collect();

    let total_slots: usize = encoded.iter().map(|s| s.header.splat_count.get() as usize).sum();
    let total_slots = u32::try_from(total_slots)
        .map_err(|_| KsplatError::InvalidOptions(format!("too many splats: {}", total_slots)))?;
    let valid: usize = encoded.iter().map(|s| s.valid).sum();

    let payload_len: usize = encoded.iter().map(|s| s.payload.len()).sum();
    let mut out =
        Vec::with_capacity(HEADER_SIZE + SECTION_HEADER_SIZE * encoded.len() + payload_len);
    let hdr = SplatBufferHeader::new(level.level(), section_count, total_slots);
    out.extend_from_slice(hdr.as_bytes());
    for section in &encoded {
        out.extend_from_slice(section.header.as_bytes());
    }
    for section in &encoded {
        out.extend_from_slice(&section.payload);
    }

    info!(
        level = level.level(),
        sections = section_count,
        valid,
        padded = total_slots,
        bytes = out.len(),
        "encoded splat buffer"
    );
    SplatBuffer::from_bytes(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::Splat;

    fn splat(center: [f32; 3], alpha: u8) -> Splat {
        Splat {
            center,
            scale: [0.5, 0.25, 1.0],
            rotation: [2.0, 0.0, 0.0, 0.0],
            color: [10, 20, 30, alpha],
        }
    }

    fn table(splats: &[Splat]) -> UncompressedSplatArray {
        let mut t = UncompressedSplatArray::new();
        splats.iter().for_each(|s| t.push(*s));
        t
    }

    #[test]
    fn test_quantization_is_stable_under_reencoding() {
        let factor = compression_scale_factor(DEFAULT_SCALE_RANGE, 5.0);
        for p in [-2.5f32, -1.234, 0.0, 0.0001, 1.7, 2.4999] {
            let q = quantize_coordinate(p, 0.0, factor, DEFAULT_SCALE_RANGE);
            let back = dequantize_coordinate(q, 0.0, factor, DEFAULT_SCALE_RANGE);
            assert_eq!(quantize_coordinate(back, 0.0, factor, DEFAULT_SCALE_RANGE), q);
            assert!((back - p).abs() <= 5.0 / (2.0 * DEFAULT_SCALE_RANGE as f32));
        }
    }

    #[test]
    fn test_quantization_clamps_out_of_block_values() {
        let factor = compression_scale_factor(100, 2.0);
        assert_eq!(quantize_coordinate(-50.0, 0.0, factor, 100), 0);
        assert_eq!(quantize_coordinate(50.0, 0.0, factor, 100), 201);
    }

    #[test]
    fn test_impossible_alpha_threshold_is_nothing_to_encode() {
        let t = table(&[splat([0.0; 3], 255), splat([1.0; 3], 0)]);
        let options = EncodeOptions {
            minimum_alpha: 256,
            ..Default::default()
        };
        assert!(matches!(
            encode(&[t], &options),
            Err(KsplatError::NothingToEncode)
        ));
        assert!(matches!(
            encode(&[UncompressedSplatArray::new()], &EncodeOptions::default()),
            Err(KsplatError::NothingToEncode)
        ));
    }

    #[test]
    fn test_zero_alpha_threshold_keeps_every_splat() {
        let t = table(&[
            splat([0.0; 3], 0),
            splat([1.0; 3], 3),
            splat([2.0; 3], 255),
        ]);
        let options = EncodeOptions {
            minimum_alpha: 0,
            ..Default::default()
        };
        let buffer = encode(&[t.clone()], &options).unwrap();
        assert_eq!(buffer.valid_splat_count(), 3);

        let buffer = encode(&[t], &EncodeOptions::default()).unwrap();
        assert_eq!(buffer.valid_splat_count(), 2);
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let t = table(&[splat([0.0; 3], 255)]);
        for level in [2u8, 3, 15] {
            let options = EncodeOptions {
                compression_level: level,
                ..Default::default()
            };
            assert!(matches!(
                encode(&[t.clone()], &options),
                Err(KsplatError::InvalidOptions(_))
            ));
        }
        let bad = [
            SectionOptions {
                scale_range: 0,
                ..Default::default()
            },
            SectionOptions {
                scale_range: 32768,
                ..Default::default()
            },
            SectionOptions {
                block_size: 0.0,
                ..Default::default()
            },
            SectionOptions {
                bucket_size: 0,
                ..Default::default()
            },
        ];
        for sections in bad {
            let options = EncodeOptions {
                sections,
                ..Default::default()
            };
            assert!(matches!(
                encode(&[t.clone()], &options),
                Err(KsplatError::InvalidOptions(_))
            ));
        }
    }

    #[test]
    fn test_colliding_color_is_nudged() {
        let mut s = splat([0.0; 3], 0);
        s.color = INVALID_COLOR;
        let options = EncodeOptions {
            minimum_alpha: 0,
            ..Default::default()
        };
        let buffer = encode(&[table(&[s])], &options).unwrap();
        let real: Vec<usize> = (0..buffer.vertex_count())
            .filter(|&i| buffer.is_valid(i))
            .collect();
        assert_eq!(real.len(), 1);
        assert_eq!(buffer.get_color(real[0]), NUDGED_COLOR);
    }

    #[test]
    fn test_per_section_overrides() {
        let a = table(&[splat([0.0; 3], 255), splat([0.5; 3], 255)]);
        let b = table(&[splat([9.0; 3], 255)]);
        let options = EncodeOptions::default().with_section_override(
            1,
            SectionOptions {
                bucket_size: 4,
                block_size: 2.0,
                scale_range: 1000,
            },
        );
        assert_eq!(options.section_options(0), SectionOptions::default());
        assert_eq!(options.section_options(1).bucket_size, 4);
        assert_eq!(options.section_options(7), SectionOptions::default());

        let buffer = encode(&[a, b], &options).unwrap();
        assert_eq!(buffer.section_count(), 2);
        assert_eq!(buffer.vertex_count(), 256 + 4);
        assert_eq!(buffer.valid_splat_count(), 3);
    }

    #[test]
    fn test_empty_section_alongside_populated_one() {
        let a = table(&[splat([0.0; 3], 255)]);
        let b = table(&[splat([1.0; 3], 0)]);
        let buffer = encode(&[a, b], &EncodeOptions::default()).unwrap();
        assert_eq!(buffer.section_count(), 2);
        assert_eq!(buffer.vertex_count(), 256);
    }
}
