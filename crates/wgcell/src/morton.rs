//! Morton (Z-order) cell keys.
//!
//! Every function here is pure and integer-exact. The WGSL kernels carry the same arithmetic
//! (see `kernels/morton.wgsl`), so a key computed on the host always equals the key computed by
//! the device for the same normalized position.

/// Largest supported number of bits per axis: a 3D key must fit in 32 bits.
pub const MAX_BITS_PER_AXIS: u32 = 10;

/// Bins a normalized coordinate into `[0, 2^bits - 1]`, rounding to the nearest bin.
///
/// The coordinate is clamped to `[0, 1]` first, so points outside the domain land in the
/// boundary cells.
pub fn bin_position(p: f32, bits: u32) -> u32 {
    let scale = ((1u32 << bits) - 1) as f32;
    (p.clamp(0.0, 1.0) * scale + 0.5) as u32
}

/// Interleaves the `bits` low bits of `i`, `j`, `k`: bit `b` of `i`, `j`, `k` goes to bit
/// `3b`, `3b + 1`, `3b + 2` of the key.
pub fn encode3(i: u32, j: u32, k: u32, bits: u32) -> u32 {
    let mut key = 0;
    for b in 0..bits {
        key |= ((i >> b) & 1) << (3 * b);
        key |= ((j >> b) & 1) << (3 * b + 1);
        key |= ((k >> b) & 1) << (3 * b + 2);
    }
    key
}

/// Inverse of [`encode3`].
pub fn decode3(key: u32, bits: u32) -> [u32; 3] {
    let mut ijk = [0; 3];
    for b in 0..bits {
        for (axis, coord) in ijk.iter_mut().enumerate() {
            *coord |= ((key >> (3 * b + axis as u32)) & 1) << b;
        }
    }
    ijk
}

/// Expands a 10-bit integer into 30 bits by inserting 2 zeros after each bit.
pub fn expand_bits(v: u32) -> u32 {
    let mut vv = (v & 0x3ff).wrapping_mul(0x00010001) & 0xFF0000FF;
    vv = vv.wrapping_mul(0x00000101) & 0x0F00F00F;
    vv = vv.wrapping_mul(0x00000011) & 0xC30C30C3;
    vv = vv.wrapping_mul(0x00000005) & 0x49249249;
    vv
}

/// Same as [`encode3`] with `bits = 10`, computed with bit tricks instead of a loop.
///
/// Coordinates below `2^bits` give the same key as `encode3(i, j, k, bits)` for any `bits`.
pub fn encode3_magic(i: u32, j: u32, k: u32) -> u32 {
    expand_bits(i) | (expand_bits(j) << 1) | (expand_bits(k) << 2)
}

/// Interleaves the `bits` low bits of `x` and `y`: bit `b` of `x`, `y` goes to bit `2b`,
/// `2b + 1` of the key.
pub fn encode2(x: u32, y: u32, bits: u32) -> u32 {
    let mut key = 0;
    for b in 0..bits {
        key |= ((x >> b) & 1) << (2 * b);
        key |= ((y >> b) & 1) << (2 * b + 1);
    }
    key
}

/// Inverse of [`encode2`].
pub fn decode2(key: u32, bits: u32) -> [u32; 2] {
    let mut xy = [0; 2];
    for b in 0..bits {
        xy[0] |= ((key >> (2 * b)) & 1) << b;
        xy[1] |= ((key >> (2 * b + 1)) & 1) << b;
    }
    xy
}

/// Index of cell `(i, j, k)` in the linear (row-major) cell table.
pub fn linear_index(i: u32, j: u32, k: u32, bits: u32) -> u32 {
    let dim = 1 << bits;
    (i * dim + j) * dim + k
}

/// Inverse of [`linear_index`].
pub fn linear_coords(index: u32, bits: u32) -> [u32; 3] {
    let dim = 1 << bits;
    [index / (dim * dim), (index / dim) % dim, index % dim]
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn known_3d_keys() {
        assert_eq!(encode3(0, 6, 7, 4), 436);
        assert_eq!(encode3(6, 6, 7, 4), 508);
        assert_eq!(encode3(7, 0, 6, 4), 361);
        assert_eq!(encode3(0, 1, 1, 4), 6);
        assert_eq!(decode3(436, 4), [0, 6, 7]);
    }

    #[test]
    fn known_2d_keys() {
        assert_eq!(encode2(0, 14, 4), 168);
        assert_eq!(encode2(14, 15, 4), 254);
        assert_eq!(encode2(8, 6, 4), 104);
        assert_eq!(encode2(5, 3, 4), 27);
        assert_eq!(decode2(27, 4), [5, 3]);
    }

    #[test]
    fn decode_inverts_encode() {
        for key in 0..(1 << 12) {
            let [i, j, k] = decode3(key, 4);
            assert_eq!(encode3(i, j, k, 4), key);
        }
        for key in 0..(1 << 8) {
            let [x, y] = decode2(key, 4);
            assert_eq!(encode2(x, y, 4), key);
        }
    }

    #[test]
    fn decode_inverts_encode_at_the_extreme_resolutions() {
        // One bit per axis: every key of the 2x2x2 grid.
        for key in 0..8 {
            let [i, j, k] = decode3(key, 1);
            assert!(i < 2 && j < 2 && k < 2);
            assert_eq!(encode3(i, j, k, 1), key);
        }
        for key in 0..4 {
            let [x, y] = decode2(key, 1);
            assert_eq!(encode2(x, y, 1), key);
        }

        let bits = MAX_BITS_PER_AXIS;
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..10_000 {
            let key = rng.random_range(0..1u32 << (3 * bits));
            let [i, j, k] = decode3(key, bits);
            assert!(i < 1 << bits && j < 1 << bits && k < 1 << bits);
            assert_eq!(encode3(i, j, k, bits), key);

            let ijk = [(); 3].map(|_| rng.random_range(0..1u32 << bits));
            assert_eq!(decode3(encode3(ijk[0], ijk[1], ijk[2], bits), bits), ijk);

            let key = rng.random_range(0..1u32 << (2 * bits));
            let [x, y] = decode2(key, bits);
            assert_eq!(encode2(x, y, bits), key);
        }
        assert_eq!(encode3(1023, 1023, 1023, bits), (1 << 30) - 1);
    }

    #[test]
    fn lattice_keys_are_unique_and_monotone() {
        let bits = 4;
        let dim = 1u32 << bits;
        let scale = (dim - 1) as f32;
        let key_of = |x: u32, y: u32, z: u32| {
            let bin = |c: u32| bin_position(c as f32 / scale, bits);
            encode3(bin(x), bin(y), bin(z), bits)
        };

        let mut keys = Vec::new();
        for z in 0..dim {
            for y in 0..dim {
                for x in 0..dim {
                    let key = key_of(x, y, z);
                    if x > 0 {
                        assert!(key > key_of(x - 1, y, z));
                    }
                    if y > 0 {
                        assert!(key > key_of(x, y - 1, z));
                    }
                    if z > 0 {
                        assert!(key > key_of(x, y, z - 1));
                    }
                    keys.push(key);
                }
            }
        }

        keys.sort_unstable();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(keys.last(), Some(&(dim * dim * dim - 1)));
    }

    #[test]
    fn magic_bits_match_the_loop() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..10_000 {
            let [i, j, k] = [(); 3].map(|_| rng.random_range(0..1024));
            assert_eq!(encode3_magic(i, j, k), encode3(i, j, k, MAX_BITS_PER_AXIS));
        }
        for i in 0..16 {
            for j in 0..16 {
                for k in 0..16 {
                    assert_eq!(encode3_magic(i, j, k), encode3(i, j, k, 4));
                }
            }
        }
    }

    #[test]
    fn binning_rounds_to_the_nearest_bin() {
        let eps = 1.0e-4;
        assert_eq!(bin_position(0.0, 3), 0);
        assert_eq!(bin_position(eps, 3), 0);
        assert_eq!(bin_position(1.0 / 8.0 + eps, 3), 1);
        assert_eq!(bin_position(0.49, 3), 3);
        assert_eq!(bin_position(0.51, 3), 4);
        assert_eq!(bin_position(1.0, 3), 7);
    }

    #[test]
    fn binning_clamps_outside_of_the_unit_interval() {
        assert_eq!(bin_position(-3.0, 4), 0);
        assert_eq!(bin_position(1.5, 4), 15);
        assert_eq!(bin_position(f32::INFINITY, 10), 1023);
    }

    #[test]
    fn linear_coords_inverts_linear_index() {
        for index in 0..(1 << 9) {
            let [i, j, k] = linear_coords(index, 3);
            assert_eq!(linear_index(i, j, k, 3), index);
        }
        assert_eq!(linear_index(1, 2, 3, 4), (16 + 2) * 16 + 3);
    }
}
