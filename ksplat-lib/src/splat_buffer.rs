use glam::{Mat3, Quat, Vec3};
use tracing::{debug, info};
use zerocopy::FromBytes;

use crate::common::{half_to_float, normalize_quat};
use crate::compressor::{compression_scale_factor, dequantize_coordinate, MAX_SCALE_RANGE};
use crate::error::{KsplatError, Result};
use crate::structures::{
    CompressionLevel, SectionHeader, Splat, SplatBufferHeader, HEADER_SIZE, INVALID_COLOR,
    SECTION_HEADER_SIZE, VERSION_MAJOR, VERSION_MINOR,
};

#[derive(Debug, Clone, Copy)]
struct SectionLayout {
    /// Global index of the first slot.
    base: usize,
    splat_count: usize,
    bucket_size: usize,
    bucket_count: usize,
    scale_range: u32,
    factor: f32,
    centers: usize,
    scales: usize,
    colors: usize,
    rotations: usize,
    buckets: usize,
}

#[derive(Debug, Clone)]
pub struct SplatBuffer {
    bytes: Vec<u8>,
    level: CompressionLevel,
    sections: Vec<SectionLayout>,
    vertex_count: usize,
    valid_count: usize,
}

/// Per-splat render attributes derived once from a [`SplatBuffer`].
#[derive(Debug, Clone, Default)]
pub struct PrecomputedSplats {
    pub centers: Vec<[f32; 3]>,
    /// Upper triangle of the 3D covariance: `xx xy xz yy yz zz`.
    pub covariances: Vec<[f32; 6]>,
    /// RGBA in `0..=1`.
    pub colors: Vec<[f32; 4]>,
    pub valid: Vec<bool>,
}

impl PrecomputedSplats {
    pub fn len(&self) -> usize {
        self.centers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centers.is_empty()
    }

    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }
}

#[inline]
fn corrupt(msg: impl Into<String>) -> KsplatError {
    KsplatError::CorruptBuffer(msg.into())
}

#[inline]
fn le_f32(bytes: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[inline]
fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

/// Σ = MᵀM with M = S·Rᵀ, packed as its six independent entries.
pub fn covariance(scale: [f32; 3], rotation: [f32; 4]) -> [f32; 6] {
    let [w, x, y, z] = normalize_quat(rotation);
    let r = Mat3::from_quat(Quat::from_xyzw(x, y, z, w));
    let m = Mat3::from_diagonal(Vec3::from_array(scale)) * r.transpose();
    let sigma = m.transpose() * m;
    [
        sigma.x_axis.x,
        sigma.y_axis.x,
        sigma.z_axis.x,
        sigma.y_axis.y,
        sigma.z_axis.y,
        sigma.z_axis.z,
    ]
}

fn checked(a: usize, b: usize, what: &str) -> Result<usize> {
    a.checked_mul(b)
        .ok_or_else(|| corrupt(format!("{} overflows", what)))
}

impl SplatBuffer {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let (header, _) = SplatBufferHeader::read_from_prefix(&bytes)
            .map_err(|_| corrupt(format!("buffer of {} bytes has no header", bytes.len())))?;
        if header.version_major != VERSION_MAJOR || header.version_minor != VERSION_MINOR {
            return Err(KsplatError::UnsupportedVersion {
                major: header.version_major,
                minor: header.version_minor,
            });
        }
        let level = CompressionLevel::from_level(header.compression_level()).ok_or_else(|| {
            corrupt(format!(
                "unknown compression level {}",
                header.compression_level()
            ))
        })?;

        let section_count = header.section_count as usize;
        let mut offset = HEADER_SIZE + section_count * SECTION_HEADER_SIZE;
        if bytes.len() < offset {
            return Err(corrupt(format!(
                "{} section headers need {} bytes, have {}",
                section_count,
                offset,
                bytes.len()
            )));
        }

        let mut sections = Vec::with_capacity(section_count);
        let mut base = 0usize;
        for i in 0..section_count {
            let at = HEADER_SIZE + i * SECTION_HEADER_SIZE;
            let (sh, _) = SectionHeader::read_from_prefix(&bytes[at..])
                .map_err(|_| corrupt(format!("section {} header is truncated", i)))?;
            let layout = Self::layout_section(i, &sh, level, base, offset)?;

            let end = layout.buckets + layout.bucket_count * level.bucket_record_size();
            if end > bytes.len() {
                return Err(corrupt(format!(
                    "section {} payload ends at {}, buffer has {} bytes",
                    i,
                    end,
                    bytes.len()
                )));
            }
            base += layout.splat_count;
            offset = end;
            sections.push(layout);
        }

        if offset != bytes.len() {
            return Err(corrupt(format!(
                "{} trailing bytes after last section",
                bytes.len() - offset
            )));
        }
        if base != header.splat_count.get() as usize {
            return Err(corrupt(format!(
                "header declares {} splats, sections hold {}",
                header.splat_count.get(),
                base
            )));
        }

        let mut buffer = Self {
            bytes,
            level,
            sections,
            vertex_count: base,
            valid_count: 0,
        };
        buffer.valid_count = (0..buffer.vertex_count)
            .filter(|&i| buffer.is_valid(i))
            .count();
        debug!(
            level = level.level(),
            sections = section_count,
            vertices = buffer.vertex_count,
            valid = buffer.valid_count,
            "loaded splat buffer"
        );
        Ok(buffer)
    }

    fn layout_section(
        index: usize,
        sh: &SectionHeader,
        level: CompressionLevel,
        base: usize,
        offset: usize,
    ) -> Result<SectionLayout> {
        let splat_count = sh.splat_count.get() as usize;
        let bucket_size = sh.bucket_size.get() as usize;
        let bucket_count = sh.bucket_count.get() as usize;
        let block_size = sh.block_size.get();
        let scale_range = sh.scale_range.get();

        if checked(bucket_size, bucket_count, "bucket table")? != splat_count {
            return Err(corrupt(format!(
                "section {}: {} buckets of {} do not hold {} splats",
                index, bucket_count, bucket_size, splat_count
            )));
        }
        if sh.bucket_record_size.get() as usize != level.bucket_record_size() {
            return Err(corrupt(format!(
                "section {}: bucket record size {} at level {}",
                index,
                sh.bucket_record_size.get(),
                level.level()
            )));
        }
        if level == CompressionLevel::Quantized
            && splat_count > 0
            && (!(1..=MAX_SCALE_RANGE).contains(&scale_range)
                || !(block_size.is_finite() && block_size > 0.0))
        {
            return Err(corrupt(format!(
                "section {}: scale range {} / block size {} cannot be dequantized",
                index, scale_range, block_size
            )));
        }

        let centers = offset;
        let scales = centers + checked(splat_count, level.center_bytes(), "centers")?;
        let colors = scales + checked(splat_count, level.scale_bytes(), "scales")?;
        let rotations = colors + checked(splat_count, level.color_bytes(), "colors")?;
        let buckets = rotations + checked(splat_count, level.rotation_bytes(), "rotations")?;

        Ok(SectionLayout {
            base,
            splat_count,
            bucket_size,
            bucket_count,
            scale_range,
            factor: compression_scale_factor(scale_range, block_size),
            centers,
            scales,
            colors,
            rotations,
            buckets,
        })
    }

    #[inline]
    fn locate(&self, index: usize) -> (&SectionLayout, usize) {
        assert!(
            index < self.vertex_count,
            "splat index {} out of range {}",
            index,
            self.vertex_count
        );
        let s = self.sections.partition_point(|s| s.base + s.splat_count <= index);
        let section = &self.sections[s];
        (section, index - section.base)
    }

    /// Total slots, padding included.
    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    #[inline]
    pub fn valid_splat_count(&self) -> usize {
        self.valid_count
    }

    #[inline]
    pub fn compression_level(&self) -> CompressionLevel {
        self.level
    }

    #[inline]
    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Geometric center of the bucket holding `index`, if the level stores one.
    pub fn bucket_center(&self, index: usize) -> Option<[f32; 3]> {
        let (section, local) = self.locate(index);
        self.slot_bucket_center(section, local)
    }

    fn slot_bucket_center(&self, section: &SectionLayout, local: usize) -> Option<[f32; 3]> {
        if self.level != CompressionLevel::Quantized {
            return None;
        }
        let at = section.buckets + (local / section.bucket_size) * self.level.bucket_record_size();
        Some([
            le_f32(&self.bytes, at),
            le_f32(&self.bytes, at + 4),
            le_f32(&self.bytes, at + 8),
        ])
    }

    #[cfg(test)]
    fn quantized_center(&self, index: usize) -> Option<[u16; 3]> {
        let (section, local) = self.locate(index);
        self.slot_quantized_center(section, local)
    }

    fn slot_quantized_center(&self, section: &SectionLayout, local: usize) -> Option<[u16; 3]> {
        if self.level != CompressionLevel::Quantized {
            return None;
        }
        let at = section.centers + local * self.level.center_bytes();
        Some([0, 2, 4].map(|o| le_u16(&self.bytes, at + o)))
    }

    pub fn get_position(&self, index: usize) -> [f32; 3] {
        let (section, local) = self.locate(index);
        self.slot_position(section, local)
    }

    fn slot_position(&self, section: &SectionLayout, local: usize) -> [f32; 3] {
        match (
            self.slot_quantized_center(section, local),
            self.slot_bucket_center(section, local),
        ) {
            (Some(stored), Some(center)) => [0usize, 1, 2].map(|k| {
                dequantize_coordinate(stored[k], center[k], section.factor, section.scale_range)
            }),
            _ => {
                let at = section.centers + local * self.level.center_bytes();
                [0, 4, 8].map(|o| le_f32(&self.bytes, at + o))
            }
        }
    }

    /// Linear scale and normalized `(w, x, y, z)` rotation.
    pub fn get_scale_rotation(&self, index: usize) -> ([f32; 3], [f32; 4]) {
        let (section, local) = self.locate(index);
        self.slot_scale_rotation(section, local)
    }

    fn slot_scale_rotation(&self, section: &SectionLayout, local: usize) -> ([f32; 3], [f32; 4]) {
        let scale_at = section.scales + local * self.level.scale_bytes();
        let rot_at = section.rotations + local * self.level.rotation_bytes();
        match self.level {
            CompressionLevel::Lossless => (
                [0, 4, 8].map(|o| le_f32(&self.bytes, scale_at + o)),
                [0, 4, 8, 12].map(|o| le_f32(&self.bytes, rot_at + o)),
            ),
            CompressionLevel::Quantized => (
                [0, 2, 4].map(|o| half_to_float(le_u16(&self.bytes, scale_at + o))),
                [0, 2, 4, 6].map(|o| half_to_float(le_u16(&self.bytes, rot_at + o))),
            ),
        }
    }

    pub fn get_color(&self, index: usize) -> [u8; 4] {
        let (section, local) = self.locate(index);
        self.slot_color(section, local)
    }

    fn slot_color(&self, section: &SectionLayout, local: usize) -> [u8; 4] {
        let at = section.colors + local * self.level.color_bytes();
        [
            self.bytes[at],
            self.bytes[at + 1],
            self.bytes[at + 2],
            self.bytes[at + 3],
        ]
    }

    /// False for bucket padding slots.
    #[inline]
    pub fn is_valid(&self, index: usize) -> bool {
        self.get_color(index) != INVALID_COLOR
    }

    pub fn get_splat(&self, index: usize) -> Splat {
        let (section, local) = self.locate(index);
        let (scale, rotation) = self.slot_scale_rotation(section, local);
        Splat {
            center: self.slot_position(section, local),
            scale,
            rotation,
            color: self.slot_color(section, local),
        }
    }

    pub fn build_precomputed_buffers(&self) -> PrecomputedSplats {
        let n = self.vertex_count;
        let mut out = PrecomputedSplats {
            centers: Vec::with_capacity(n),
            covariances: Vec::with_capacity(n),
            colors: Vec::with_capacity(n),
            valid: Vec::with_capacity(n),
        };
        // sections are contiguous and in slot order
        for section in &self.sections {
            for local in 0..section.splat_count {
                let color = self.slot_color(section, local);
                let valid = color != INVALID_COLOR;
                out.valid.push(valid);
                if !valid {
                    out.centers.push([0.0; 3]);
                    out.covariances.push([0.0; 6]);
                    out.colors.push([0.0; 4]);
                    continue;
                }
                let (scale, rotation) = self.slot_scale_rotation(section, local);
                out.centers.push(self.slot_position(section, local));
                out.covariances.push(covariance(scale, rotation));
                out.colors.push(color.map(|c| c as f32 / 255.0));
            }
        }
        info!(
            vertices = n,
            valid = self.valid_count,
            "built precomputed splat buffers"
        );
        out
    }
}
