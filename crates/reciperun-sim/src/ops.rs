//! Elementwise operators understood by the simulator.

use reciperun::dtype::DType;
use reciperun::error::{LaunchError, LaunchResult};

/// Operator selected by a node's guid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Add,
    Sub,
    Mul,
    Relu,
    Identity,
    /// `x * scale[0] + bias[0]`.
    ScaleBias,
}

impl OpKind {
    /// Parses a guid, ignoring a trailing `_f32`, `_bf16` or `_f16` type suffix.
    pub fn parse(guid: &str) -> Option<Self> {
        let base = ["_f32", "_bf16", "_f16"]
            .iter()
            .find_map(|suffix| guid.strip_suffix(suffix))
            .unwrap_or(guid);
        match base {
            "add" => Some(OpKind::Add),
            "sub" => Some(OpKind::Sub),
            "mul" => Some(OpKind::Mul),
            "relu" => Some(OpKind::Relu),
            "identity" => Some(OpKind::Identity),
            "scale_bias" => Some(OpKind::ScaleBias),
            _ => None,
        }
    }

    pub fn arity(self) -> usize {
        match self {
            OpKind::Add | OpKind::Sub | OpKind::Mul => 2,
            OpKind::Relu | OpKind::Identity => 1,
            OpKind::ScaleBias => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Relu => "relu",
            OpKind::Identity => "identity",
            OpKind::ScaleBias => "scale_bias",
        }
    }

    /// Applies the operator; the result has as many elements as the first operand.
    pub(crate) fn apply(self, operands: &[Vec<f32>]) -> LaunchResult<Vec<f32>> {
        if operands.len() != self.arity() {
            return Err(LaunchError::contract(format!(
                "{} expects {} operands, got {}",
                self.as_str(),
                self.arity(),
                operands.len()
            )));
        }
        let x = &operands[0];
        let out = match self {
            OpKind::Add => binary(self, x, &operands[1], |a, b| a + b)?,
            OpKind::Sub => binary(self, x, &operands[1], |a, b| a - b)?,
            OpKind::Mul => binary(self, x, &operands[1], |a, b| a * b)?,
            OpKind::Relu => x.iter().map(|v| v.max(0.0)).collect(),
            OpKind::Identity => x.clone(),
            OpKind::ScaleBias => {
                let scale = scalar(self, &operands[1])?;
                let bias = scalar(self, &operands[2])?;
                x.iter().map(|v| v * scale + bias).collect()
            }
        };
        Ok(out)
    }
}

fn binary(op: OpKind, lhs: &[f32], rhs: &[f32], f: impl Fn(f32, f32) -> f32) -> LaunchResult<Vec<f32>> {
    match rhs.len() {
        1 => Ok(lhs.iter().map(|a| f(*a, rhs[0])).collect()),
        n if n >= lhs.len() => Ok(lhs.iter().zip(rhs).map(|(a, b)| f(*a, *b)).collect()),
        n => Err(LaunchError::contract(format!(
            "{} operands hold {} and {n} elements",
            op.as_str(),
            lhs.len()
        ))),
    }
}

fn scalar(op: OpKind, values: &[f32]) -> LaunchResult<f32> {
    values.first().copied().ok_or_else(|| {
        LaunchError::contract(format!("{} expects a scalar operand", op.as_str()))
    })
}

/// Decodes `bytes` of `dtype` into `f32` values.
pub(crate) fn decode(dtype: DType, bytes: &[u8]) -> LaunchResult<Vec<f32>> {
    match dtype {
        DType::F32 => Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()),
        DType::Bf16 => Ok(bytes
            .chunks_exact(2)
            .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect()),
        DType::F16 => Ok(bytes
            .chunks_exact(2)
            .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect()),
        other => Err(LaunchError::unsupported(other, "simulator operand")),
    }
}

/// Encodes `values` as `dtype`.
pub(crate) fn encode(dtype: DType, values: &[f32]) -> LaunchResult<Vec<u8>> {
    let mut out = Vec::with_capacity(values.len() * dtype.size_in_bytes() as usize);
    for value in values {
        match dtype {
            DType::F32 => out.extend_from_slice(&value.to_le_bytes()),
            DType::Bf16 => out.extend_from_slice(&half::bf16::from_f32(*value).to_le_bytes()),
            DType::F16 => out.extend_from_slice(&half::f16::from_f32(*value).to_le_bytes()),
            other => return Err(LaunchError::unsupported(other, "simulator result")),
        }
    }
    Ok(out)
}

/// Rounds every value to the nearest bf16.
pub(crate) fn round_to_bf16(values: &mut [f32]) {
    for value in values {
        *value = half::bf16::from_f32(*value).to_f32();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_suffixes_are_ignored() {
        assert_eq!(OpKind::parse("add_f32"), Some(OpKind::Add));
        assert_eq!(OpKind::parse("scale_bias_bf16"), Some(OpKind::ScaleBias));
        assert_eq!(OpKind::parse("relu"), Some(OpKind::Relu));
        assert_eq!(OpKind::parse("conv2d"), None);
    }

    #[test]
    fn scalar_rhs_broadcasts() {
        let out = OpKind::Mul
            .apply(&[vec![1.0, 2.0, 3.0], vec![2.0]])
            .unwrap();
        assert_eq!(out, vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn scale_bias_uses_first_elements() {
        let out = OpKind::ScaleBias
            .apply(&[vec![1.0, -1.0], vec![3.0], vec![0.5]])
            .unwrap();
        assert_eq!(out, vec![3.5, -2.5]);
    }

    #[test]
    fn mismatched_operands_are_rejected() {
        assert!(OpKind::Add.apply(&[vec![1.0, 2.0], vec![1.0, 2.0, 3.0]]).is_ok());
        assert!(OpKind::Add.apply(&[vec![1.0, 2.0, 3.0], vec![1.0, 2.0]]).is_err());
        assert!(OpKind::Relu.apply(&[vec![1.0], vec![1.0]]).is_err());
    }

    #[test]
    fn bf16_rounding_drops_low_mantissa_bits() {
        let mut values = vec![1.0 + f32::EPSILON];
        round_to_bf16(&mut values);
        assert_eq!(values, vec![1.0]);
    }
}
