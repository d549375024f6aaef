use std::f32::consts::SQRT_2;

use tracing::debug;

use crate::common::clamp_u8;
use crate::error::{KsplatError, Result};
use crate::ply::{PlyElement, PlyHeader, PlyProperty};
use crate::structures::{Splat, UncompressedSplatArray};

pub const CHUNK_SIZE: usize = 256;

const BOUND_NAMES: [&str; 12] = [
    "min_x",
    "min_y",
    "min_z",
    "max_x",
    "max_y",
    "max_z",
    "min_scale_x",
    "min_scale_y",
    "min_scale_z",
    "max_scale_x",
    "max_scale_y",
    "max_scale_z",
];

const COLOR_BOUND_NAMES: [&str; 6] = ["min_r", "min_g", "min_b", "max_r", "max_g", "max_b"];

const PACKED_NAMES: [&str; 4] = [
    "packed_position",
    "packed_rotation",
    "packed_scale",
    "packed_color",
];

#[derive(Debug, Clone, Copy, PartialEq)]
struct ChunkBounds {
    min: [f32; 3],
    max: [f32; 3],
    min_scale: [f32; 3],
    max_scale: [f32; 3],
    min_color: [f32; 3],
    max_color: [f32; 3],
}

struct ChunkLayout {
    bounds: [PlyProperty; 12],
    color: Option<[PlyProperty; 6]>,
}

impl ChunkLayout {
    fn resolve(chunk: &PlyElement) -> Result<Self> {
        let bounds = required_properties(chunk, BOUND_NAMES)?;
        let color = if COLOR_BOUND_NAMES
            .iter()
            .all(|name| chunk.property(name).is_some())
        {
            Some(required_properties(chunk, COLOR_BOUND_NAMES)?)
        } else {
            None
        };
        Ok(Self { bounds, color })
    }

    fn read(&self, data: &[u8], base: usize) -> ChunkBounds {
        let b = self.bounds.each_ref().map(|p| p.read_f32(data, base));
        let (min_color, max_color) = match &self.color {
            Some(color) => {
                let c = color.each_ref().map(|p| p.read_f32(data, base));
                ([c[0], c[1], c[2]], [c[3], c[4], c[5]])
            }
            None => ([0.0; 3], [1.0; 3]),
        };
        ChunkBounds {
            min: [b[0], b[1], b[2]],
            max: [b[3], b[4], b[5]],
            min_scale: [b[6], b[7], b[8]],
            max_scale: [b[9], b[10], b[11]],
            min_color,
            max_color,
        }
    }
}

fn required_properties<const N: usize>(
    element: &PlyElement,
    names: [&str; N],
) -> Result<[PlyProperty; N]> {
    let mut out = Vec::with_capacity(N);
    for name in names {
        let property = element
            .property(name)
            .ok_or_else(|| KsplatError::MissingProperty(format!("{}.{}", element.name, name)))?;
        out.push(property.clone());
    }
    out.try_into()
        .map_err(|_| KsplatError::Format("Property layout size mismatch".to_string()))
}

#[inline]
fn lerp(min: f32, max: f32, t: f32) -> f32 {
    min + (max - min) * t
}

/// 11/10/11-bit normalized triple, x in the high bits.
#[inline]
pub(crate) fn unpack_111011(value: u32) -> [f32; 3] {
    [
        ((value >> 21) & 2047) as f32 / 2047.0,
        ((value >> 11) & 1023) as f32 / 1023.0,
        (value & 2047) as f32 / 2047.0,
    ]
}

/// Smallest-three quaternion: the top two bits select the omitted `(w, x, y, z)` slot.
#[inline]
pub(crate) fn unpack_rotation(value: u32) -> [f32; 4] {
    let component = |shift: u32| (((value >> shift) & 1023) as f32 / 1023.0 - 0.5) * SQRT_2;
    let stored = [component(20), component(10), component(0)];
    let omitted = (value >> 30) as usize;
    let rest = (1.0 - stored.iter().map(|c| c * c).sum::<f32>()).max(0.0).sqrt();

    let mut q = [0.0f32; 4];
    let mut next = 0;
    for (i, slot) in q.iter_mut().enumerate() {
        if i == omitted {
            *slot = rest;
        } else {
            *slot = stored[next];
            next += 1;
        }
    }
    q
}

/// RGBA bytes, red in the high byte.
#[inline]
pub(crate) fn unpack_color(value: u32) -> [f32; 4] {
    [
        ((value >> 24) & 255) as f32 / 255.0,
        ((value >> 16) & 255) as f32 / 255.0,
        ((value >> 8) & 255) as f32 / 255.0,
        (value & 255) as f32 / 255.0,
    ]
}

fn decode_vertex(bounds: &ChunkBounds, packed: [u32; 4]) -> Splat {
    let [position, rotation, scale, color] = packed;
    let p = unpack_111011(position);
    let s = unpack_111011(scale);
    let c = unpack_color(color);
    Splat {
        center: [0usize, 1, 2].map(|d| lerp(bounds.min[d], bounds.max[d], p[d])),
        scale: [0usize, 1, 2].map(|d| lerp(bounds.min_scale[d], bounds.max_scale[d], s[d]).exp()),
        rotation: unpack_rotation(rotation),
        color: [
            clamp_u8(lerp(bounds.min_color[0], bounds.max_color[0], c[0]) * 255.0),
            clamp_u8(lerp(bounds.min_color[1], bounds.max_color[1], c[1]) * 255.0),
            clamp_u8(lerp(bounds.min_color[2], bounds.max_color[2], c[2]) * 255.0),
            (color & 255) as u8,
        ],
    }
}

fn check_len(raw_data: &[u8], offset: usize, element: &PlyElement) -> Result<()> {
    let need = offset
        .checked_add(element.byte_len()?)
        .ok_or_else(|| KsplatError::Format("Overflow in byte calculation".to_string()))?;
    if raw_data.len() < need {
        return Err(KsplatError::Truncated {
            need,
            have: raw_data.len(),
        });
    }
    Ok(())
}

/// Decodes the body of a chunked PLY. Elements other than `chunk` and `vertex` are skipped.
pub fn parse_body(raw_data: &[u8], header: &PlyHeader) -> Result<UncompressedSplatArray> {
    let (chunk_offset, chunk) = header
        .locate("chunk")?
        .ok_or_else(|| KsplatError::Format("Missing chunk element".to_string()))?;
    let (vertex_offset, vertex) = header
        .locate("vertex")?
        .ok_or_else(|| KsplatError::Format("Missing vertex element".to_string()))?;

    let expected_chunks = vertex.count.div_ceil(CHUNK_SIZE);
    if chunk.count < expected_chunks {
        return Err(KsplatError::Format(format!(
            "Not enough chunk records: have {}, need at least {}",
            chunk.count, expected_chunks
        )));
    }
    check_len(raw_data, chunk_offset, chunk)?;
    check_len(raw_data, vertex_offset, vertex)?;

    let chunk_layout = ChunkLayout::resolve(chunk)?;
    let packed = required_properties(vertex, PACKED_NAMES)?;

    let chunks: Vec<ChunkBounds> = (0..expected_chunks)
        .map(|i| chunk_layout.read(raw_data, chunk_offset + i * chunk.record_size))
        .collect();

    let mut splats = UncompressedSplatArray::with_capacity(vertex.count);
    for row in 0..vertex.count {
        let base = vertex_offset + row * vertex.record_size;
        let fields = packed.each_ref().map(|p| p.read_u32(raw_data, base));
        splats.push(decode_vertex(&chunks[row / CHUNK_SIZE], fields));
    }
    debug!(
        splats = splats.splat_count(),
        chunks = chunks.len(),
        "decoded chunked PLY body"
    );
    Ok(splats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ply::parse_splats;

    fn pack_111011(t: [f32; 3]) -> u32 {
        let x = (t[0] * 2047.0).round() as u32;
        let y = (t[1] * 1023.0).round() as u32;
        let z = (t[2] * 2047.0).round() as u32;
        (x << 21) | (y << 11) | z
    }

    fn pack_rotation(q: [f32; 4]) -> u32 {
        let mut largest = 0;
        for i in 1..4 {
            if q[i].abs() > q[largest].abs() {
                largest = i;
            }
        }
        let sign = if q[largest] < 0.0 { -1.0 } else { 1.0 };
        let mut out = (largest as u32) << 30;
        let mut shift: u32 = 20;
        for (i, &c) in q.iter().enumerate() {
            if i == largest {
                continue;
            }
            let v = ((c * sign / SQRT_2 + 0.5) * 1023.0).round() as u32;
            out |= v << shift;
            shift = shift.saturating_sub(10);
        }
        out
    }

    struct TestVertex {
        t_position: [f32; 3],
        t_scale: [f32; 3],
        rotation: [f32; 4],
        rgba: [u8; 4],
    }

    fn create_compressed_ply(chunk_count: usize, vertices: &[TestVertex], with_sh: bool) -> Vec<u8> {
        create_compressed_ply_with_colors(chunk_count, vertices, with_sh, None)
    }

    fn create_compressed_ply_with_colors(
        chunk_count: usize,
        vertices: &[TestVertex],
        with_sh: bool,
        color_bounds: Option<[f32; 6]>,
    ) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"ply\nformat binary_little_endian 1.0\n");
        raw.extend_from_slice(format!("element chunk {}\n", chunk_count).as_bytes());
        for name in BOUND_NAMES {
            raw.extend_from_slice(format!("property float {}\n", name).as_bytes());
        }
        if color_bounds.is_some() {
            for name in COLOR_BOUND_NAMES {
                raw.extend_from_slice(format!("property float {}\n", name).as_bytes());
            }
        }
        raw.extend_from_slice(format!("element vertex {}\n", vertices.len()).as_bytes());
        for name in PACKED_NAMES {
            raw.extend_from_slice(format!("property uint {}\n", name).as_bytes());
        }
        if with_sh {
            raw.extend_from_slice(format!("element sh {}\n", vertices.len()).as_bytes());
            raw.extend_from_slice(b"property uchar f_rest_0\n");
        }
        raw.extend_from_slice(b"end_header\n");

        #[rustfmt::skip]
        let bounds: [f32; 12] = [
            -1.0, 0.0, 10.0,
            1.0, 2.0, 20.0,
            -2.0, -2.0, -2.0,
            0.0, 0.0, 0.0,
        ];
        for _ in 0..chunk_count {
            for b in bounds.iter().chain(color_bounds.iter().flatten()) {
                raw.extend_from_slice(&b.to_le_bytes());
            }
        }
        for v in vertices {
            let color = u32::from_be_bytes(v.rgba);
            for field in [
                pack_111011(v.t_position),
                pack_rotation(v.rotation),
                pack_111011(v.t_scale),
                color,
            ] {
                raw.extend_from_slice(&field.to_le_bytes());
            }
        }
        if with_sh {
            raw.extend(std::iter::repeat(0u8).take(vertices.len()));
        }
        raw
    }

    #[test]
    fn test_unpack_rotation_places_omitted_component() {
        // w omitted, x=y=z=0 encoded at mid-range
        let mid = 511u32;
        let value = (mid << 20) | (mid << 10) | mid;
        let q = unpack_rotation(value);
        assert!((q[0] - 1.0).abs() < 1e-2);

        let value = (2u32 << 30) | (mid << 20) | (mid << 10) | mid;
        let q = unpack_rotation(value);
        assert!((q[2] - 1.0).abs() < 1e-2);
        assert!(q[0].abs() < 1e-2);
    }

    #[test]
    fn test_decode_chunked_ply() {
        let half = std::f32::consts::FRAC_1_SQRT_2;
        let vertices = [
            TestVertex {
                t_position: [0.5, 0.5, 0.5],
                t_scale: [1.0, 0.0, 0.5],
                rotation: [1.0, 0.0, 0.0, 0.0],
                rgba: [255, 128, 0, 200],
            },
            TestVertex {
                t_position: [0.0, 1.0, 1.0],
                t_scale: [0.0, 0.0, 0.0],
                rotation: [half, 0.0, 0.0, half],
                rgba: [1, 2, 3, 4],
            },
        ];
        let raw = create_compressed_ply(1, &vertices, true);
        let splats = parse_splats(&raw).expect("chunked ply should decode");
        assert_eq!(splats.splat_count(), 2);

        let a = splats.get(1);
        assert!((a.center[0] - 0.0).abs() < 1e-3);
        assert!((a.center[1] - 1.0).abs() < 2e-3);
        assert!((a.center[2] - 15.0).abs() < 1e-2);
        assert!((a.scale[0] - 1.0).abs() < 1e-5);
        assert!((a.scale[1] - (-2.0f32).exp()).abs() < 1e-5);
        assert_eq!(a.color, [255, 128, 0, 200]);
        assert!((a.rotation[0] - 1.0).abs() < 1e-2);

        let b = splats.get(2);
        assert_eq!(b.center, [-1.0, 2.0, 20.0]);
        assert_eq!(b.color, [1, 2, 3, 4]);
        for (got, want) in b.rotation.iter().zip([half, 0.0, 0.0, half]) {
            assert!((got - want).abs() < 2e-3, "{:?}", b.rotation);
        }
    }

    #[test]
    fn test_chunk_color_bounds_rescale_rgb() {
        let vertex = |rgba: [u8; 4]| TestVertex {
            t_position: [0.0; 3],
            t_scale: [0.0; 3],
            rotation: [1.0, 0.0, 0.0, 0.0],
            rgba,
        };
        // min_r min_g min_b max_r max_g max_b
        let color_bounds = [0.0, 0.25, 1.0, 0.8, 0.75, 1.0];
        let raw = create_compressed_ply_with_colors(
            1,
            &[vertex([255, 0, 37, 9]), vertex([0, 255, 200, 77])],
            false,
            Some(color_bounds),
        );
        let splats = parse_splats(&raw).unwrap();

        // alpha is never rescaled
        assert_eq!(splats.get(1).color, [204, 64, 255, 9]);
        assert_eq!(splats.get(2).color, [0, 191, 255, 77]);

        // without bounds the packed bytes pass through
        let raw = create_compressed_ply(1, &[vertex([255, 0, 37, 9])], false);
        assert_eq!(parse_splats(&raw).unwrap().get(1).color, [255, 0, 37, 9]);
    }

    #[test]
    fn test_too_few_chunks() {
        let vertices: Vec<TestVertex> = (0..CHUNK_SIZE + 1)
            .map(|_| TestVertex {
                t_position: [0.0; 3],
                t_scale: [0.0; 3],
                rotation: [1.0, 0.0, 0.0, 0.0],
                rgba: [0; 4],
            })
            .collect();
        let raw = create_compressed_ply(1, &vertices, false);
        assert!(matches!(parse_splats(&raw), Err(KsplatError::Format(_))));

        let raw = create_compressed_ply(2, &vertices, false);
        assert_eq!(parse_splats(&raw).unwrap().splat_count(), CHUNK_SIZE + 1);
    }

    #[test]
    fn test_truncated_chunked_body() {
        let vertices = [TestVertex {
            t_position: [0.0; 3],
            t_scale: [0.0; 3],
            rotation: [1.0, 0.0, 0.0, 0.0],
            rgba: [0; 4],
        }];
        let mut raw = create_compressed_ply(1, &vertices, false);
        raw.pop();
        assert!(matches!(
            parse_splats(&raw),
            Err(KsplatError::Truncated { .. })
        ));
    }
}
