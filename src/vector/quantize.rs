//! Scalar quantization of stored vectors.
//!
//! Each component is multiplied by the width's scale (127 for 8-bit, 7 for
//! 4-bit), rounded, and clamped into the signed range of the width. 4-bit
//! codes are packed two per byte, even components in the low nibble.
//! Decoding divides by the same scale, so `decode(encode(v))` is lossy but
//! deterministic, and re-encoding a decoded vector yields the same codes.

use bincode::{Decode, Encode};

use crate::vector::types::{QuantizationWidth, VectorDimension};

/// Lower-precision encoding of one vector.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct QuantizedVector {
    width: QuantizationWidth,
    dimension: u32,
    codes: Vec<u8>,
}

impl QuantizedVector {
    /// Quantizes `vector` at the given width.
    #[must_use]
    pub fn encode(vector: &[f32], width: QuantizationWidth) -> Self {
        let codes = match width {
            QuantizationWidth::Eight => vector.iter().map(|&x| quantize_8(x) as u8).collect(),
            QuantizationWidth::Four => vector
                .chunks(2)
                .map(|pair| {
                    let lo = (quantize_4(pair[0]) as u8) & 0x0F;
                    let hi = pair.get(1).map_or(0, |&x| (quantize_4(x) as u8) & 0x0F);
                    lo | (hi << 4)
                })
                .collect(),
        };

        Self {
            width,
            dimension: vector.len() as u32,
            codes,
        }
    }

    #[must_use]
    pub fn width(&self) -> QuantizationWidth {
        self.width
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension as usize
    }

    /// Size of the packed codes in bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.codes.len()
    }

    /// Decoded value of component `i`.
    ///
    /// # Panics
    /// Panics if `i` is out of bounds.
    #[must_use]
    pub fn component(&self, i: usize) -> f32 {
        let scale = self.width.scale();
        match self.width {
            QuantizationWidth::Eight => f32::from(self.codes[i] as i8) / scale,
            QuantizationWidth::Four => {
                let byte = self.codes[i / 2];
                let nibble = if i % 2 == 0 { byte & 0x0F } else { byte >> 4 };
                // Shift the nibble into the high bits so the arithmetic
                // shift back down sign-extends it.
                let signed = ((nibble << 4) as i8) >> 4;
                f32::from(signed) / scale
            }
        }
    }

    /// Dequantizes back to a full-precision vector.
    #[must_use]
    pub fn decode(&self) -> Vec<f32> {
        (0..self.dimension()).map(|i| self.component(i)).collect()
    }

    /// Whether the encoding carries the expected number of codes.
    #[must_use]
    pub fn is_well_formed(&self, dimension: VectorDimension) -> bool {
        self.dimension() == dimension.get()
            && self.codes.len() == self.width.encoded_len(dimension.get())
    }
}

fn quantize_8(x: f32) -> i8 {
    (x * QuantizationWidth::Eight.scale()).round().clamp(-128.0, 127.0) as i8
}

fn quantize_4(x: f32) -> i8 {
    (x * QuantizationWidth::Four.scale()).round().clamp(-8.0, 7.0) as i8
}

/// Representation of a vector held by the index.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum StoredVector {
    Full(Vec<f32>),
    Quantized(QuantizedVector),
}

impl StoredVector {
    #[must_use]
    pub fn dimension(&self) -> usize {
        match self {
            Self::Full(v) => v.len(),
            Self::Quantized(q) => q.dimension(),
        }
    }

    /// Iterates the (decoded) components.
    #[must_use]
    pub fn components(&self) -> Components<'_> {
        match self {
            Self::Full(v) => Components::Full(v.iter()),
            Self::Quantized(q) => Components::Quantized { q, pos: 0 },
        }
    }

    /// Decoded copy of the vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<f32> {
        match self {
            Self::Full(v) => v.clone(),
            Self::Quantized(q) => q.decode(),
        }
    }

    #[must_use]
    pub fn quantization(&self) -> Option<QuantizationWidth> {
        match self {
            Self::Full(_) => None,
            Self::Quantized(q) => Some(q.width()),
        }
    }

    /// Bytes used by the vector payload.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        match self {
            Self::Full(v) => v.len() * std::mem::size_of::<f32>(),
            Self::Quantized(q) => q.byte_len(),
        }
    }
}

/// Iterator over the components of a [`StoredVector`].
pub enum Components<'a> {
    Full(std::slice::Iter<'a, f32>),
    Quantized { q: &'a QuantizedVector, pos: usize },
}

impl Iterator for Components<'_> {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        match self {
            Self::Full(iter) => iter.next().copied(),
            Self::Quantized { q, pos } => {
                if *pos >= q.dimension() {
                    return None;
                }
                let value = q.component(*pos);
                *pos += 1;
                Some(value)
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = match self {
            Self::Full(iter) => iter.len(),
            Self::Quantized { q, pos } => q.dimension().saturating_sub(*pos),
        };
        (remaining, Some(remaining))
    }
}
