//! Face template vectors and their on-disk encoding.
//!
//! Wire format: `b"RCT1"`, then the dimension as a little-endian `u32`,
//! then `dimension` little-endian `f32` values. Decoding is bit-exact.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const TEMPLATE_MAGIC: &[u8; 4] = b"RCT1";
const HEADER_LEN: usize = 8;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("bad magic: expected RCT1")]
    BadMagic,
    #[error("template blob too short: {0} bytes")]
    Truncated(usize),
    #[error("template has zero dimension")]
    Empty,
    #[error("payload length mismatch: dimension {dim} needs {expected} bytes, got {actual}")]
    LengthMismatch {
        dim: usize,
        expected: usize,
        actual: usize,
    },
    #[error("non-finite value at index {0}")]
    NonFinite(usize),
}

/// Fixed-length face template (encoding vector) produced by a face encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    values: Vec<f32>,
}

impl Template {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance to `other`, or `None` if the dimensions differ.
    pub fn distance(&self, other: &Template) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        let sum: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum();
        Some(sum.sqrt())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.values.len() * 4);
        out.extend_from_slice(TEMPLATE_MAGIC);
        out.extend_from_slice(&(self.values.len() as u32).to_le_bytes());
        for v in &self.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TemplateError> {
        if bytes.len() < HEADER_LEN {
            return Err(TemplateError::Truncated(bytes.len()));
        }
        let (header, payload) = bytes.split_at(HEADER_LEN);
        if &header[..4] != TEMPLATE_MAGIC {
            return Err(TemplateError::BadMagic);
        }
        let dim = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if dim == 0 {
            return Err(TemplateError::Empty);
        }
        let expected = dim * 4;
        if payload.len() != expected {
            return Err(TemplateError::LengthMismatch {
                dim,
                expected,
                actual: payload.len(),
            });
        }

        let mut values = Vec::with_capacity(dim);
        for (i, chunk) in payload.chunks_exact(4).enumerate() {
            let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if !v.is_finite() {
                return Err(TemplateError::NonFinite(i));
            }
            values.push(v);
        }
        Ok(Self { values })
    }
}

impl From<Vec<f32>> for Template {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_is_exact() {
        let t = Template::new(vec![0.1, -2.5, 1e-7, 3.14159, f32::MIN_POSITIVE]);
        let decoded = Template::from_bytes(&t.to_bytes()).unwrap();
        assert_eq!(decoded, t);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = Template::new(vec![1.0]).to_bytes();
        bytes[0] = b'X';
        assert_eq!(Template::from_bytes(&bytes), Err(TemplateError::BadMagic));
    }

    #[test]
    fn test_rejects_truncated_payload() {
        let bytes = Template::new(vec![1.0, 2.0]).to_bytes();
        let err = Template::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, TemplateError::LengthMismatch { dim: 2, .. }));
        assert_eq!(Template::from_bytes(&bytes[..3]), Err(TemplateError::Truncated(3)));
    }

    #[test]
    fn test_rejects_non_finite() {
        let mut bytes = Template::new(vec![1.0, 2.0]).to_bytes();
        bytes[12..16].copy_from_slice(&f32::NAN.to_le_bytes());
        assert_eq!(Template::from_bytes(&bytes), Err(TemplateError::NonFinite(1)));
    }

    #[test]
    fn test_rejects_zero_dimension() {
        let mut bytes = TEMPLATE_MAGIC.to_vec();
        bytes.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(Template::from_bytes(&bytes), Err(TemplateError::Empty));
    }

    #[test]
    fn test_distance() {
        let a = Template::new(vec![0.0, 0.0]);
        let b = Template::new(vec![3.0, 4.0]);
        assert!((a.distance(&b).unwrap() - 5.0).abs() < 1e-6);
        assert_eq!(a.distance(&Template::new(vec![1.0])), None);
    }
}
