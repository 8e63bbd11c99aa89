//! Bit-exact comparison of output buffers.

use reciperun::dtype::DType;
use reciperun::error::{LaunchError, LaunchResult};

/// Renders one little-endian element of `dtype` for a mismatch report.
fn render(dtype: DType, bytes: &[u8]) -> String {
    let mut raw = [0u8; 8];
    raw[..bytes.len()].copy_from_slice(bytes);
    let word = u64::from_le_bytes(raw);
    match dtype {
        DType::F32 => f32::from_bits(word as u32).to_string(),
        DType::F64 => f64::from_bits(word).to_string(),
        DType::Bf16 => half::bf16::from_bits(word as u16).to_string(),
        DType::F16 => half::f16::from_bits(word as u16).to_string(),
        DType::I8 => (word as u8 as i8).to_string(),
        DType::I16 => (word as u16 as i16).to_string(),
        DType::I32 => (word as u32 as i32).to_string(),
        DType::I64 => (word as i64).to_string(),
        DType::U8 | DType::U16 | DType::U32 | DType::U64 => word.to_string(),
        DType::Bool => (word != 0).to_string(),
        DType::Fp8E4M3 | DType::Fp8E5M2 => format!("{word:#04x}"),
    }
}

/// Compares the first `elements` values of two buffers.
///
/// Floats are equal only when their bit patterns are, so `NaN` payloads and signed zeros must
/// match too. The first differing element is reported as [`LaunchError::DataMismatch`].
pub fn compare_buffers(
    tensor: &str,
    dtype: DType,
    elements: u64,
    first: &[u8],
    second: &[u8],
) -> LaunchResult<()> {
    let width = dtype.size_in_bytes() as usize;
    let bytes = usize::try_from(elements)
        .ok()
        .and_then(|elements| elements.checked_mul(width))
        .ok_or_else(|| LaunchError::contract(format!("tensor {tensor} is too large")))?;
    for (run, buffer) in [("first", first), ("second", second)] {
        if buffer.len() < bytes {
            return Err(LaunchError::contract(format!(
                "{run} run output {tensor} holds {} bytes, {bytes} expected",
                buffer.len()
            )));
        }
    }
    let lhs = first[..bytes].chunks_exact(width);
    let rhs = second[..bytes].chunks_exact(width);
    for (index, (a, b)) in lhs.zip(rhs).enumerate() {
        if a != b {
            return Err(LaunchError::DataMismatch {
                tensor: tensor.to_string(),
                index,
                first: render(dtype, a),
                second: render(dtype, b),
            });
        }
    }
    tracing::debug!(tensor, elements, dtype = %dtype, "outputs match");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn reports_first_mismatch() {
        let err = compare_buffers(
            "out",
            DType::F32,
            3,
            &f32_bytes(&[1.0, 2.0, 3.0]),
            &f32_bytes(&[1.0, 2.5, 4.0]),
        )
        .unwrap_err();
        match err {
            LaunchError::DataMismatch {
                tensor,
                index,
                first,
                second,
            } => {
                assert_eq!(tensor, "out");
                assert_eq!(index, 1);
                assert_eq!(first, "2");
                assert_eq!(second, "2.5");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn only_requested_prefix_is_compared() {
        let first = f32_bytes(&[1.0, 2.0]);
        let second = f32_bytes(&[1.0, 9.0]);
        assert!(compare_buffers("out", DType::F32, 1, &first, &second).is_ok());
    }

    #[test]
    fn signed_zeros_differ() {
        let err = compare_buffers(
            "out",
            DType::F32,
            1,
            &f32_bytes(&[0.0]),
            &f32_bytes(&[-0.0]),
        );
        assert!(matches!(err, Err(LaunchError::DataMismatch { index: 0, .. })));
    }

    #[test]
    fn integers_render_signed() {
        let err = compare_buffers("idx", DType::I16, 1, &(-3i16).to_le_bytes(), &4i16.to_le_bytes())
            .unwrap_err();
        assert!(err.to_string().contains("first run -3, second run 4"));
    }

    #[test]
    fn short_buffers_are_rejected() {
        let err = compare_buffers("out", DType::F32, 4, &[0u8; 16], &[0u8; 8]).unwrap_err();
        assert!(err.is_contract_violation());
    }
}
