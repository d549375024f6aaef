use std::io::Read;

use foldhash::HashMap;
use memchr::memmem;
use tracing::debug;

use crate::common::{logit_to_alpha, sh_dc_to_u8};
use crate::compressed_ply;
use crate::error::{KsplatError, Result};
use crate::structures::{Splat, UncompressedSplatArray};

const PLY_MAGIC: &[u8] = b"ply";
const HEADER_MARKER: &[u8] = b"\nend_header";
const MAX_HEADER_SIZE: usize = 65536;
const READ_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlyScalarType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
}

impl PlyScalarType {
    pub fn from_name(name: &str) -> Result<Self> {
        let ty = match name {
            "char" | "int8" => PlyScalarType::Int8,
            "uchar" | "uint8" => PlyScalarType::Uint8,
            "short" | "int16" => PlyScalarType::Int16,
            "ushort" | "uint16" => PlyScalarType::Uint16,
            "int" | "int32" => PlyScalarType::Int32,
            "uint" | "uint32" => PlyScalarType::Uint32,
            "int64" => PlyScalarType::Int64,
            "uint64" => PlyScalarType::Uint64,
            "float" | "float32" => PlyScalarType::Float32,
            "double" | "float64" => PlyScalarType::Float64,
            _ => return Err(KsplatError::UnknownPropertyType(name.to_string())),
        };
        Ok(ty)
    }

    pub fn size(self) -> usize {
        match self {
            PlyScalarType::Int8 | PlyScalarType::Uint8 => 1,
            PlyScalarType::Int16 | PlyScalarType::Uint16 => 2,
            PlyScalarType::Int32 | PlyScalarType::Uint32 | PlyScalarType::Float32 => 4,
            PlyScalarType::Int64 | PlyScalarType::Uint64 | PlyScalarType::Float64 => 8,
        }
    }

    /// Reads the numeric value at `offset` as f32. The caller guarantees `offset + size()` is in bounds.
    #[inline]
    pub fn read_f32(self, data: &[u8], offset: usize) -> f32 {
        match self {
            PlyScalarType::Int8 => data[offset] as i8 as f32,
            PlyScalarType::Uint8 => data[offset] as f32,
            PlyScalarType::Int16 => i16::from_le_bytes(le_bytes(data, offset)) as f32,
            PlyScalarType::Uint16 => u16::from_le_bytes(le_bytes(data, offset)) as f32,
            PlyScalarType::Int32 => i32::from_le_bytes(le_bytes(data, offset)) as f32,
            PlyScalarType::Uint32 => u32::from_le_bytes(le_bytes(data, offset)) as f32,
            PlyScalarType::Int64 => i64::from_le_bytes(le_bytes(data, offset)) as f32,
            PlyScalarType::Uint64 => u64::from_le_bytes(le_bytes(data, offset)) as f32,
            PlyScalarType::Float32 => f32::from_le_bytes(le_bytes(data, offset)),
            PlyScalarType::Float64 => f64::from_le_bytes(le_bytes(data, offset)) as f32,
        }
    }

    /// Reads the value at `offset` as raw bits for packed integer fields.
    #[inline]
    pub fn read_u32(self, data: &[u8], offset: usize) -> u32 {
        match self {
            PlyScalarType::Int8 => data[offset] as i8 as u32,
            PlyScalarType::Uint8 => data[offset] as u32,
            PlyScalarType::Int16 => i16::from_le_bytes(le_bytes(data, offset)) as u32,
            PlyScalarType::Uint16 => u16::from_le_bytes(le_bytes(data, offset)) as u32,
            PlyScalarType::Int32 => i32::from_le_bytes(le_bytes(data, offset)) as u32,
            PlyScalarType::Uint32 => u32::from_le_bytes(le_bytes(data, offset)),
            PlyScalarType::Int64 => i64::from_le_bytes(le_bytes(data, offset)) as u32,
            PlyScalarType::Uint64 => u64::from_le_bytes(le_bytes(data, offset)) as u32,
            PlyScalarType::Float32 => f32::from_le_bytes(le_bytes(data, offset)).to_bits(),
            PlyScalarType::Float64 => f64::from_le_bytes(le_bytes(data, offset)) as u32,
        }
    }
}

#[inline(always)]
fn le_bytes<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlyProperty {
    pub name: String,
    pub ty: PlyScalarType,
    /// Byte offset inside the element record.
    pub offset: usize,
}

impl PlyProperty {
    #[inline]
    pub fn read_f32(&self, data: &[u8], record_offset: usize) -> f32 {
        self.ty.read_f32(data, record_offset + self.offset)
    }

    #[inline]
    pub fn read_u32(&self, data: &[u8], record_offset: usize) -> u32 {
        self.ty.read_u32(data, record_offset + self.offset)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlyElement {
    pub name: String,
    pub count: usize,
    pub properties: Vec<PlyProperty>,
    pub record_size: usize,
}

impl PlyElement {
    fn new(name: &str, count: usize) -> Self {
        Self {
            name: name.to_string(),
            count,
            properties: Vec::new(),
            record_size: 0,
        }
    }

    fn add_property(&mut self, name: &str, ty: PlyScalarType) -> Result<()> {
        if self.property(name).is_some() {
            return Err(KsplatError::Format(format!(
                "Duplicate property '{}' in element '{}'",
                name, self.name
            )));
        }
        self.properties.push(PlyProperty {
            name: name.to_string(),
            ty,
            offset: self.record_size,
        });
        self.record_size += ty.size();
        Ok(())
    }

    pub fn property(&self, name: &str) -> Option<&PlyProperty> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Total body bytes occupied by this element.
    pub fn byte_len(&self) -> Result<usize> {
        self.count
            .checked_mul(self.record_size)
            .ok_or_else(|| KsplatError::Format("Overflow in byte calculation".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlyHeader {
    pub elements: Vec<PlyElement>,
    /// Offset of the first body byte in the input.
    pub data_offset: usize,
}

impl PlyHeader {
    pub fn element(&self, name: &str) -> Option<&PlyElement> {
        self.elements.iter().find(|e| e.name == name)
    }

    /// Number of splats declared by the `vertex` element.
    pub fn splat_count(&self) -> usize {
        self.element("vertex").map(|e| e.count).unwrap_or(0)
    }

    /// True for the pre-compressed chunked variant.
    pub fn is_compressed(&self) -> bool {
        self.element("chunk").is_some()
    }

    /// Vertex property name to declared scalar type.
    pub fn property_types(&self) -> HashMap<&str, PlyScalarType> {
        self.element("vertex")
            .map(|e| e.properties.iter().map(|p| (p.name.as_str(), p.ty)).collect())
            .unwrap_or_default()
    }

    /// Absolute offset of the named element's body and the element itself.
    /// Elements are stored back to back in header order.
    pub fn locate(&self, name: &str) -> Result<Option<(usize, &PlyElement)>> {
        let mut offset = self.data_offset;
        for element in &self.elements {
            if element.name == name {
                return Ok(Some((offset, element)));
            }
            offset = offset
                .checked_add(element.byte_len()?)
                .ok_or_else(|| KsplatError::Format("Overflow in byte calculation".to_string()))?;
        }
        Ok(None)
    }
}

/// Finds the end of a PLY header in data that arrives in pieces.
///
/// The terminator line may be split across any number of pushed chunks.
#[derive(Debug, Default)]
pub struct HeaderScanner {
    buffer: Vec<u8>,
    scanned: usize,
    marker_at: Option<usize>,
}

impl HeaderScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk. Returns the body offset once the terminator line is complete.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<usize>> {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() >= PLY_MAGIC.len() && !self.buffer.starts_with(PLY_MAGIC) {
            return Err(KsplatError::Format(
                "Not a .ply file (missing 'ply' header)".to_string(),
            ));
        }
        if let Some(offset) = self.scan(false) {
            return Ok(Some(offset));
        }
        if self.buffer.len() > MAX_HEADER_SIZE {
            // no terminator within the header size limit
            return Err(KsplatError::MissingHeaderEnd);
        }
        Ok(None)
    }

    /// Signals end of input; a terminator without a trailing newline is accepted here.
    pub fn finish(&mut self) -> Result<usize> {
        if !self.buffer.starts_with(PLY_MAGIC) {
            return Err(KsplatError::Format(
                "Not a .ply file (missing 'ply' header)".to_string(),
            ));
        }
        self.scan(true).ok_or(KsplatError::MissingHeaderEnd)
    }

    /// Bytes pushed so far.
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Header text up to (not including) the terminator line.
    fn header_text(&self) -> Option<&[u8]> {
        self.marker_at.map(|at| &self.buffer[..at])
    }

    fn scan(&mut self, at_eof: bool) -> Option<usize> {
        loop {
            let from = self.scanned;
            let Some(pos) = memmem::find(&self.buffer[from..], HEADER_MARKER) else {
                // keep a marker-sized tail for the next chunk
                self.scanned = self.buffer.len().saturating_sub(HEADER_MARKER.len() - 1);
                return None;
            };
            let at = from + pos;
            let end = at + HEADER_MARKER.len();
            match &self.buffer[end..] {
                [b'\n', ..] => {
                    self.marker_at = Some(at);
                    return Some(end + 1);
                }
                [b'\r', b'\n', ..] => {
                    self.marker_at = Some(at);
                    return Some(end + 2);
                }
                [] | [b'\r'] if at_eof => {
                    self.marker_at = Some(at);
                    return Some(self.buffer.len());
                }
                [] | [b'\r'] => {
                    self.scanned = at;
                    return None;
                }
                _ => {
                    // "end_headerX" is not the terminator
                    self.scanned = at + 1;
                }
            }
        }
    }
}

#[inline]
fn next_line<'b>(buffer: &'b [u8], offset: &mut usize) -> Option<&'b [u8]> {
    if *offset >= buffer.len() {
        return None;
    }
    let start = *offset;

    let line = match memchr::memchr(b'\n', &buffer[start..]) {
        Some(pos) => {
            *offset = start + pos + 1;
            &buffer[start..start + pos]
        }
        None => {
            *offset = buffer.len();
            &buffer[start..]
        }
    };
    Some(line.strip_suffix(b"\r").unwrap_or(line))
}

fn parse_header_lines(text: &[u8], data_offset: usize) -> Result<PlyHeader> {
    let mut offset = 0;
    let first = next_line(text, &mut offset)
        .ok_or_else(|| KsplatError::Format("No 'ply' line".to_string()))?;
    if first.trim_ascii() != PLY_MAGIC {
        return Err(KsplatError::Format(
            "Not a .ply file (missing 'ply' header)".to_string(),
        ));
    }

    let mut elements: Vec<PlyElement> = Vec::new();
    let mut format_seen = false;
    while let Some(raw) = next_line(text, &mut offset) {
        let line = std::str::from_utf8(raw)
            .map_err(|e| KsplatError::Format(format!("UTF-8 error in header: {}", e)))?
            .trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields[0] {
            "format" => {
                if fields.len() != 3 {
                    return Err(KsplatError::Format(format!("Invalid format line: {}", line)));
                }
                if fields[1] != "binary_little_endian" || fields[2] != "1.0" {
                    return Err(KsplatError::UnsupportedEncoding(format!(
                        "{} {}",
                        fields[1], fields[2]
                    )));
                }
                format_seen = true;
            }
            "comment" | "obj_info" => {}
            "element" => {
                if fields.len() != 3 {
                    return Err(KsplatError::Format(format!("Invalid element line: {}", line)));
                }
                let count: usize = fields[2].parse().map_err(|e| {
                    KsplatError::Format(format!("Invalid element count '{}': {}", fields[2], e))
                })?;
                elements.push(PlyElement::new(fields[1], count));
            }
            "property" => {
                if fields.get(1) == Some(&"list") {
                    return Err(KsplatError::Format(
                        "PLY list properties are not supported".to_string(),
                    ));
                }
                if fields.len() != 3 {
                    return Err(KsplatError::Format(format!("Invalid property line: {}", line)));
                }
                let Some(element) = elements.last_mut() else {
                    return Err(KsplatError::Format("Property outside of element".to_string()));
                };
                let ty = PlyScalarType::from_name(fields[1])?;
                element.add_property(fields[2], ty)?;
            }
            _ => {
                return Err(KsplatError::Format(format!(
                    "Unsupported PLY header line: {}",
                    line
                )))
            }
        }
    }

    if !format_seen {
        return Err(KsplatError::Format("Missing PLY format line".to_string()));
    }

    Ok(PlyHeader {
        elements,
        data_offset,
    })
}

/// Parses the textual header of a complete PLY file held in memory.
pub fn parse_header(raw_data: &[u8]) -> Result<PlyHeader> {
    let mut scanner = HeaderScanner::new();
    let data_offset = match scanner.push(raw_data)? {
        Some(offset) => offset,
        None => scanner.finish()?,
    };
    let text = scanner
        .header_text()
        .ok_or(KsplatError::MissingHeaderEnd)?;
    let header = parse_header_lines(text, data_offset)?;
    debug!(
        elements = header.elements.len(),
        splats = header.splat_count(),
        data_offset,
        compressed = header.is_compressed(),
        "parsed PLY header"
    );
    Ok(header)
}

/// Reads a PLY header from a stream in fixed-size chunks.
///
/// Returns the header and every byte consumed so far; body bytes start at
/// `header.data_offset` in the returned buffer.
pub fn read_header<R: Read>(reader: &mut R) -> Result<(PlyHeader, Vec<u8>)> {
    let mut scanner = HeaderScanner::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    let data_offset = loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break scanner.finish()?;
        }
        if let Some(offset) = scanner.push(&chunk[..n])? {
            break offset;
        }
    };
    let text = scanner
        .header_text()
        .ok_or(KsplatError::MissingHeaderEnd)?;
    let header = parse_header_lines(text, data_offset)?;
    Ok((header, scanner.into_bytes()))
}

/// The splat attributes the plain decoder understands. Every other property is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplatAttribute {
    X,
    Y,
    Z,
    Scale0,
    Scale1,
    Scale2,
    Rot0,
    Rot1,
    Rot2,
    Rot3,
    FDc0,
    FDc1,
    FDc2,
    Opacity,
}

impl SplatAttribute {
    pub const ALL: [SplatAttribute; 14] = [
        SplatAttribute::X,
        SplatAttribute::Y,
        SplatAttribute::Z,
        SplatAttribute::Scale0,
        SplatAttribute::Scale1,
        SplatAttribute::Scale2,
        SplatAttribute::Rot0,
        SplatAttribute::Rot1,
        SplatAttribute::Rot2,
        SplatAttribute::Rot3,
        SplatAttribute::FDc0,
        SplatAttribute::FDc1,
        SplatAttribute::FDc2,
        SplatAttribute::Opacity,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SplatAttribute::X => "x",
            SplatAttribute::Y => "y",
            SplatAttribute::Z => "z",
            SplatAttribute::Scale0 => "scale_0",
            SplatAttribute::Scale1 => "scale_1",
            SplatAttribute::Scale2 => "scale_2",
            SplatAttribute::Rot0 => "rot_0",
            SplatAttribute::Rot1 => "rot_1",
            SplatAttribute::Rot2 => "rot_2",
            SplatAttribute::Rot3 => "rot_3",
            SplatAttribute::FDc0 => "f_dc_0",
            SplatAttribute::FDc1 => "f_dc_1",
            SplatAttribute::FDc2 => "f_dc_2",
            SplatAttribute::Opacity => "opacity",
        }
    }

    /// `None` means the property is ignored.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.name() == name)
    }
}

/// Resolved property for every [`SplatAttribute`], indexed by discriminant.
struct VertexLayout {
    slots: [PlyProperty; 14],
    record_size: usize,
}

impl VertexLayout {
    fn resolve(vertex: &PlyElement) -> Result<Self> {
        let mut found: [Option<&PlyProperty>; 14] = [None; 14];
        for property in &vertex.properties {
            if let Some(attr) = SplatAttribute::from_name(&property.name) {
                found[attr as usize] = Some(property);
            }
        }
        let mut slots = Vec::with_capacity(found.len());
        for (attr, slot) in SplatAttribute::ALL.into_iter().zip(found) {
            let property =
                slot.ok_or_else(|| KsplatError::MissingProperty(attr.name().to_string()))?;
            slots.push(property.clone());
        }
        let slots: [PlyProperty; 14] = slots
            .try_into()
            .map_err(|_| KsplatError::Format("Vertex layout size mismatch".to_string()))?;
        Ok(Self {
            slots,
            record_size: vertex.record_size,
        })
    }

    #[inline]
    fn get(&self, data: &[u8], base: usize, attr: SplatAttribute) -> f32 {
        self.slots[attr as usize].read_f32(data, base)
    }

    fn read_splat(&self, data: &[u8], base: usize) -> Splat {
        use SplatAttribute::*;
        let scale = [Scale0, Scale1, Scale2].map(|a| self.get(data, base, a).exp());
        let [r, g, b] = [FDc0, FDc1, FDc2].map(|a| sh_dc_to_u8(self.get(data, base, a)));
        Splat {
            center: [X, Y, Z].map(|a| self.get(data, base, a)),
            scale,
            rotation: [Rot0, Rot1, Rot2, Rot3].map(|a| self.get(data, base, a)),
            color: [r, g, b, logit_to_alpha(self.get(data, base, Opacity))],
        }
    }
}

/// Decodes the body of a PLY file whose header was parsed with [`parse_header`].
pub fn parse_body(raw_data: &[u8], header: &PlyHeader) -> Result<UncompressedSplatArray> {
    if header.is_compressed() {
        return compressed_ply::parse_body(raw_data, header);
    }

    let (offset, vertex) = header
        .locate("vertex")?
        .ok_or_else(|| KsplatError::Format("Missing vertex element".to_string()))?;
    if vertex.count == 0 {
        return Ok(UncompressedSplatArray::new());
    }

    let layout = VertexLayout::resolve(vertex)?;
    let need = offset
        .checked_add(vertex.byte_len()?)
        .ok_or_else(|| KsplatError::Format("Overflow in byte calculation".to_string()))?;
    if raw_data.len() < need {
        return Err(KsplatError::Truncated {
            need,
            have: raw_data.len(),
        });
    }

    let mut splats = UncompressedSplatArray::with_capacity(vertex.count);
    for row in 0..vertex.count {
        splats.push(layout.read_splat(raw_data, offset + row * layout.record_size));
    }
    debug!(splats = splats.splat_count(), "decoded plain PLY body");
    Ok(splats)
}

/// Parses a complete PLY file, plain or chunked.
pub fn parse_splats(raw_data: &[u8]) -> Result<UncompressedSplatArray> {
    let header = parse_header(raw_data)?;
    parse_body(raw_data, &header)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TEST_PROPERTIES: [&str; 14] = [
        "x", "y", "z", "scale_0", "scale_1", "scale_2", "rot_0", "rot_1", "rot_2", "rot_3",
        "opacity", "f_dc_0", "f_dc_1", "f_dc_2",
    ];

    /// Float PLY with the 14 known properties, in the order of [`TEST_PROPERTIES`].
    pub(crate) fn create_test_ply(rows: &[[f32; 14]]) -> Vec<u8> {
        let mut raw_ply = Vec::new();
        raw_ply.extend_from_slice(b"ply\nformat binary_little_endian 1.0\n");
        raw_ply.extend_from_slice(format!("element vertex {}\n", rows.len()).as_bytes());
        for name in TEST_PROPERTIES {
            raw_ply.extend_from_slice(format!("property float {}\n", name).as_bytes());
        }
        raw_ply.extend_from_slice(b"end_header\n");
        for row in rows {
            for &f in row {
                raw_ply.extend_from_slice(&f.to_le_bytes());
            }
        }
        raw_ply
    }

    #[rustfmt::skip]
    const ONE_ROW: [f32; 14] = [
        // x, y, z
        0.0, 0.1, 0.2,
        // scale_0, scale_1, scale_2 (natural log)
        0.0, -1.0, 1.0,
        // rot_0..rot_3 (w, x, y, z)
        1.0, 0.0, 0.0, 0.0,
        // opacity logit
        0.0,
        // f_dc_0, f_dc_1, f_dc_2
        0.0, 1.0, -1.0,
    ];

    #[test]
    fn test_parse_empty_ply() {
        // minimal .ply, 0 vertices, no trailing newline
        let data =
            b"ply\nformat binary_little_endian 1.0\nelement vertex 0\nproperty float x\nend_header";
        let splats = parse_splats(data).expect("empty .ply should parse");
        assert_eq!(splats.splat_count(), 0);
        assert_eq!(splats.len(), 1);
    }

    #[test]
    fn test_parse_single_vertex_applies_transforms() {
        let raw = create_test_ply(&[ONE_ROW]);
        let header = parse_header(&raw).unwrap();
        assert_eq!(header.splat_count(), 1);
        assert_eq!(header.property_types()["opacity"], PlyScalarType::Float32);
        assert_eq!(header.element("vertex").unwrap().record_size, 14 * 4);

        let splats = parse_body(&raw, &header).unwrap();
        let s = splats.get(1);
        assert_eq!(s.center, [0.0, 0.1, 0.2]);
        assert!((s.scale[0] - 1.0).abs() < 1e-6);
        assert!((s.scale[1] - (-1.0f32).exp()).abs() < 1e-6);
        assert!((s.scale[2] - 1.0f32.exp()).abs() < 1e-5);
        assert_eq!(s.rotation, [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(s.color, [128, 199, 56, 128]);
    }

    #[test]
    fn test_unknown_properties_are_ignored() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"ply\nformat binary_little_endian 1.0\ncomment made by hand\n");
        raw.extend_from_slice(b"element vertex 1\nproperty float nx\nproperty uchar flag\n");
        for name in TEST_PROPERTIES {
            raw.extend_from_slice(format!("property float {}\n", name).as_bytes());
        }
        raw.extend_from_slice(b"property double f_rest_0\nend_header\n");
        raw.extend_from_slice(&7.0f32.to_le_bytes());
        raw.push(3);
        for f in ONE_ROW {
            raw.extend_from_slice(&f.to_le_bytes());
        }
        raw.extend_from_slice(&0.5f64.to_le_bytes());

        let splats = parse_splats(&raw).unwrap();
        assert_eq!(splats.splat_count(), 1);
        assert_eq!(splats.get(1).center, [0.0, 0.1, 0.2]);
    }

    #[test]
    fn test_rejects_malformed_headers() {
        let err = parse_header(b"plx\nformat binary_little_endian 1.0\nend_header\n").unwrap_err();
        assert!(matches!(err, KsplatError::Format(_)));

        let err = parse_header(b"ply\nformat ascii 1.0\nelement vertex 0\nend_header\n").unwrap_err();
        assert!(matches!(err, KsplatError::UnsupportedEncoding(_)));

        let err = parse_header(
            b"ply\nformat binary_little_endian 1.0\nelement vertex 1\nproperty half x\nend_header\n",
        )
        .unwrap_err();
        assert!(matches!(err, KsplatError::UnknownPropertyType(ref t) if t == "half"));

        let err = parse_header(b"ply\nformat binary_little_endian 1.0\nelement vertex 1\n").unwrap_err();
        assert!(matches!(err, KsplatError::MissingHeaderEnd));

        let err = parse_header(
            b"ply\nformat binary_little_endian 1.0\nelement vertex 1\nproperty list uchar int i\nend_header\n",
        )
        .unwrap_err();
        assert!(err.is_format_error());
    }

    #[test]
    fn test_missing_required_property() {
        let raw = b"ply\nformat binary_little_endian 1.0\nelement vertex 1\nproperty float x\nend_header\n\0\0\0\0";
        let err = parse_splats(raw).unwrap_err();
        assert!(matches!(err, KsplatError::MissingProperty(ref p) if p == "y"));
    }

    #[test]
    fn test_truncated_body() {
        let mut raw = create_test_ply(&[ONE_ROW, ONE_ROW]);
        raw.truncate(raw.len() - 3);
        let err = parse_splats(&raw).unwrap_err();
        assert!(matches!(err, KsplatError::Truncated { .. }));
    }

    #[test]
    fn test_marker_split_across_chunks() {
        let raw = create_test_ply(&[ONE_ROW]);
        let expected = parse_header(&raw).unwrap().data_offset;
        let marker = memmem::find(&raw, b"end_header").unwrap();

        // every split point that cuts the terminator line
        for split in marker - 1..=marker + 10 {
            let mut scanner = HeaderScanner::new();
            assert_eq!(scanner.push(&raw[..split]).unwrap(), None, "split {}", split);
            assert_eq!(scanner.push(&raw[split..]).unwrap(), Some(expected));
        }

        // one byte at a time
        let mut scanner = HeaderScanner::new();
        let mut found = None;
        for b in &raw {
            if let Some(offset) = scanner.push(std::slice::from_ref(b)).unwrap() {
                found = Some(offset);
                break;
            }
        }
        assert_eq!(found, Some(expected));
    }

    #[test]
    fn test_end_header_inside_comment_is_not_terminator() {
        let raw = b"ply\nformat binary_little_endian 1.0\ncomment end_header\n\
element vertex 0\nend_headerish\nend_header\n";
        let mut scanner = HeaderScanner::new();
        assert_eq!(scanner.push(raw).unwrap(), Some(raw.len()));
    }

    struct ChunkedReader<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for ChunkedReader<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn test_read_header_from_stream() {
        let raw = create_test_ply(&[ONE_ROW]);
        let mut reader = ChunkedReader { data: &raw, step: 7 };
        let (header, consumed) = read_header(&mut reader).unwrap();
        assert_eq!(header, parse_header(&raw).unwrap());
        assert!(consumed.len() >= header.data_offset);
        assert_eq!(&consumed[..], &raw[..consumed.len()]);
    }

    #[test]
    fn test_oversized_header_is_rejected() {
        let mut raw = b"ply\nformat binary_little_endian 1.0\n".to_vec();
        while raw.len() <= MAX_HEADER_SIZE {
            raw.extend_from_slice(b"comment padding padding padding padding\n");
        }
        let mut reader = ChunkedReader {
            data: &raw,
            step: READ_CHUNK_SIZE,
        };
        assert!(matches!(
            read_header(&mut reader).unwrap_err(),
            KsplatError::MissingHeaderEnd
        ));
    }

    #[test]
    fn test_read_header_hits_eof() {
        let raw = b"ply\nformat binary_little_endian 1.0\nelement vertex 3\n";
        let mut reader = ChunkedReader { data: raw, step: 5 };
        assert!(matches!(
            read_header(&mut reader).unwrap_err(),
            KsplatError::MissingHeaderEnd
        ));
    }
}
