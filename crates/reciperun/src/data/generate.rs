use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::dtype::DType;
use crate::error::{LaunchError, LaunchResult};

/// Stable 64-bit FNV-1a hash used to seed per-tensor generators.
pub fn name_seed(name: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    name.bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME))
}

fn encode(dtype: DType, elements: usize, mut next: impl FnMut() -> f64) -> LaunchResult<Vec<u8>> {
    if !dtype.is_generatable() {
        return Err(LaunchError::unsupported(dtype, "data generation"));
    }
    let mut out = Vec::with_capacity(elements * dtype.size_in_bytes() as usize);
    for _ in 0..elements {
        let value = next();
        match dtype {
            DType::F32 => out.extend_from_slice(&(value as f32).to_le_bytes()),
            DType::Bf16 => out.extend_from_slice(&half::bf16::from_f64(value).to_le_bytes()),
            DType::F16 => out.extend_from_slice(&half::f16::from_f64(value).to_le_bytes()),
            DType::I8 => out.extend_from_slice(&(value as i8).to_le_bytes()),
            DType::U8 => out.extend_from_slice(&(value as u8).to_le_bytes()),
            DType::I16 => out.extend_from_slice(&(value as i16).to_le_bytes()),
            DType::U16 => out.extend_from_slice(&(value as u16).to_le_bytes()),
            DType::I32 => out.extend_from_slice(&(value as i32).to_le_bytes()),
            DType::U32 => out.extend_from_slice(&(value as u32).to_le_bytes()),
            DType::I64 => out.extend_from_slice(&(value as i64).to_le_bytes()),
            DType::U64 => out.extend_from_slice(&(value as u64).to_le_bytes()),
            other => return Err(LaunchError::unsupported(other, "data generation")),
        }
    }
    Ok(out)
}

/// Fills `elements` values of `dtype` with `value`.
pub fn uniform_buffer(dtype: DType, elements: usize, value: f64) -> LaunchResult<Vec<u8>> {
    encode(dtype, elements, || value)
}

/// Fills `elements` values drawn uniformly from `[min, max]`.
///
/// Integer types draw whole numbers inside the range; unsigned types clamp the lower bound to 0.
pub fn random_buffer(
    dtype: DType,
    elements: usize,
    min: f64,
    max: f64,
    seed: u64,
) -> LaunchResult<Vec<u8>> {
    if min.is_nan() || max.is_nan() || min > max {
        return Err(LaunchError::data(format!(
            "invalid random range [{min}, {max}]"
        )));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    if dtype.is_float() {
        return encode(dtype, elements, || rng.gen_range(min..=max));
    }
    let mut low = min.ceil() as i64;
    let high = max.floor() as i64;
    if dtype.is_unsigned_integer() {
        low = low.max(0);
    }
    if low > high {
        return Err(LaunchError::data(format!(
            "range [{min}, {max}] holds no {dtype} values"
        )));
    }
    encode(dtype, elements, || rng.gen_range(low..=high) as f64)
}
