use zerocopy::byteorder::little_endian::{F32, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 1;
pub const FLAG_COMPRESSION_MASK: u8 = 0x0F;

/// Index of the reserved placeholder splat in every splat table.
pub const SENTINEL_INDEX: u32 = 0;

/// Color written into padding slots. Real splats never encode to this value.
pub const INVALID_COLOR: [u8; 4] = [255, 0, 0, 0];

/// Column byte widths applied uniformly to one section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionLevel {
    /// f32 centers, scales and rotations.
    Lossless = 0,
    /// u16 bucket-relative centers, f16 scales and rotations.
    Quantized = 1,
}

impl CompressionLevel {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::Lossless),
            1 => Some(Self::Quantized),
            _ => None,
        }
    }

    #[inline]
    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn center_bytes(self) -> usize {
        match self {
            Self::Lossless => 12,
            Self::Quantized => 6,
        }
    }

    pub fn scale_bytes(self) -> usize {
        match self {
            Self::Lossless => 12,
            Self::Quantized => 6,
        }
    }

    pub fn rotation_bytes(self) -> usize {
        match self {
            Self::Lossless => 16,
            Self::Quantized => 8,
        }
    }

    pub const fn color_bytes(self) -> usize {
        4
    }

    pub fn bytes_per_splat(self) -> usize {
        self.center_bytes() + self.scale_bytes() + self.color_bytes() + self.rotation_bytes()
    }

    /// Size of one bucket-center record in the section payload.
    pub fn bucket_record_size(self) -> usize {
        match self {
            Self::Lossless => 0,
            Self::Quantized => 12,
        }
    }
}

/// A single decoded splat. Rotation is `(w, x, y, z)`, color is RGBA with alpha as opacity.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Splat {
    pub center: [f32; 3],
    pub scale: [f32; 3],
    pub rotation: [f32; 4],
    pub color: [u8; 4],
}

impl Splat {
    pub const SENTINEL: Splat = Splat {
        center: [0.0; 3],
        scale: [0.0; 3],
        rotation: [1.0, 0.0, 0.0, 0.0],
        color: [0; 4],
    };

    #[inline]
    pub fn alpha(&self) -> u8 {
        self.color[3]
    }
}

/// Column-oriented table of splats as produced by the parsers.
///
/// Index 0 always holds [`Splat::SENTINEL`]; real splats start at index 1.
#[derive(Debug, Clone)]
pub struct UncompressedSplatArray {
    pub centers: Vec<[f32; 3]>,
    pub scales: Vec<[f32; 3]>,
    pub rotations: Vec<[f32; 4]>,
    pub colors: Vec<[u8; 4]>,
}

impl Default for UncompressedSplatArray {
    fn default() -> Self {
        Self::new()
    }
}

impl UncompressedSplatArray {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(splat_count: usize) -> Self {
        let mut array = Self {
            centers: Vec::with_capacity(splat_count + 1),
            scales: Vec::with_capacity(splat_count + 1),
            rotations: Vec::with_capacity(splat_count + 1),
            colors: Vec::with_capacity(splat_count + 1),
        };
        array.push(Splat::SENTINEL);
        array
    }

    pub fn push(&mut self, splat: Splat) {
        self.centers.push(splat.center);
        self.scales.push(splat.scale);
        self.rotations.push(splat.rotation);
        self.colors.push(splat.color);
    }

    /// Number of rows including the sentinel.
    #[inline]
    pub fn len(&self) -> usize {
        self.centers.len()
    }

    /// True when only the sentinel is present.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.splat_count() == 0
    }

    /// Number of real splats.
    #[inline]
    pub fn splat_count(&self) -> usize {
        self.len() - 1
    }

    #[inline]
    pub fn is_sentinel(index: usize) -> bool {
        index == SENTINEL_INDEX as usize
    }

    pub fn get(&self, index: usize) -> Splat {
        Splat {
            center: self.centers[index],
            scale: self.scales[index],
            rotation: self.rotations[index],
            color: self.colors[index],
        }
    }

    /// Real splats, skipping the sentinel.
    pub fn iter(&self) -> impl Iterator<Item = Splat> + '_ {
        (1..self.len()).map(move |i| self.get(i))
    }
}

/// A fixed-capacity spatial cell. `indices` is always padded to the bucket size
/// with [`SENTINEL_INDEX`].
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub center: [f32; 3],
    pub indices: Vec<u32>,
}

impl Bucket {
    pub fn occupied(&self) -> usize {
        self.indices.iter().filter(|&&i| i != SENTINEL_INDEX).count()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct SplatBufferHeader {
    pub version_major: u8,
    pub version_minor: u8,
    pub flags: u8,
    pub section_count: u8,
    pub splat_count: U32,
}

impl SplatBufferHeader {
    pub fn new(compression_level: u8, section_count: u8, splat_count: u32) -> Self {
        Self {
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            flags: compression_level & FLAG_COMPRESSION_MASK,
            section_count,
            splat_count: U32::new(splat_count),
        }
    }

    #[inline]
    pub fn compression_level(&self) -> u8 {
        self.flags & FLAG_COMPRESSION_MASK
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct SectionHeader {
    pub splat_count: U32,
    pub bucket_size: U32,
    pub bucket_count: U32,
    pub block_size: F32,
    pub bucket_record_size: U16,
    pub scale_range: U32,
}

pub const HEADER_SIZE: usize = size_of::<SplatBufferHeader>();
pub const SECTION_HEADER_SIZE: usize = size_of::<SectionHeader>();
