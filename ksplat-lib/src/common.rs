use half::f16;

pub const ZSTD_MAX_COMPRESSION_LVL: u32 = 22;

/// Degree-0 spherical harmonic basis constant.
pub const SH_C0: f32 = 0.282_094_8;

#[inline]
pub(crate) fn clamp_u8(x: f32) -> u8 {
    x.round().clamp(0.0, 255.0) as u8
}

#[inline]
pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[inline]
pub(crate) fn inv_sigmoid(x: f32) -> f32 {
    (x / (1.0 - x)).ln()
}

/// SH-DC coefficient to an 8-bit color channel.
#[inline]
pub(crate) fn sh_dc_to_u8(v: f32) -> u8 {
    clamp_u8(255.0 * (0.5 + SH_C0 * v))
}

#[inline]
pub(crate) fn u8_to_sh_dc(c: u8) -> f32 {
    (c as f32 / 255.0 - 0.5) / SH_C0
}

/// Opacity logit to an 8-bit alpha.
#[inline]
pub(crate) fn logit_to_alpha(v: f32) -> u8 {
    clamp_u8(sigmoid(v) * 255.0)
}

#[inline]
pub(crate) fn alpha_to_logit(a: u8) -> f32 {
    // 0 and 255 would map to infinities
    let x = (a as f32 / 255.0).clamp(1.0e-6, 1.0 - 1.0e-6);
    inv_sigmoid(x)
}

#[inline]
pub(crate) fn half_to_float(bits: u16) -> f32 {
    f16::from_bits(bits).to_f32()
}

#[inline]
pub(crate) fn float_to_half(x: f32) -> u16 {
    f16::from_f32(x).to_bits()
}

/// Normalizes a `(w, x, y, z)` quaternion. A degenerate quaternion becomes identity.
#[inline]
pub(crate) fn normalize_quat(q: [f32; 4]) -> [f32; 4] {
    let norm = (q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]).sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return [1.0, 0.0, 0.0, 0.0];
    }
    [q[0] / norm, q[1] / norm, q[2] / norm, q[3] / norm]
}
