//! Z-order (Morton) codes for block ordering

/// Move bit `i` of a 21-bit value to bit `3i`
fn spread_bits(x: u32) -> u64 {
    let mut x = x as u64 & 0x1fffff;
    x = (x | (x << 32)) & 0x1f00000000ffff;
    x = (x | (x << 16)) & 0x1f0000ff0000ff;
    x = (x | (x << 8)) & 0x100f00f00f00f00f;
    x = (x | (x << 4)) & 0x10c30c30c30c30c3;
    x = (x | (x << 2)) & 0x1249249249249249;
    x
}

/// Interleave three non-negative 21-bit coordinates, x in the lowest bit.
/// Higher bits of each input are ignored.
pub fn encode_morton_3d(x: u32, y: u32, z: u32) -> u64 {
    spread_bits(x) | (spread_bits(y) << 1) | (spread_bits(z) << 2)
}
