use std::mem::size_of;
use std::ptr;

use crate::error::{Error, Result};
use crate::layout::{NativeWord, RawLayout};

/// Per-sample extraction loop of a numeric buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct DecodeKernel {
    layout: RawLayout,
    scale: f64,
    offset: f64,
}

impl DecodeKernel {
    pub(crate) fn new(layout: RawLayout, scale: f64, offset: f64) -> Self {
        Self { layout, scale, offset }
    }

    pub(crate) fn disable_conversion(&mut self) {
        self.scale = 1.0;
        self.offset = 0.0;
    }

    pub(crate) fn layout(&self) -> &RawLayout {
        &self.layout
    }

    /// Decodes samples `sample_start..sample_start + sample_count` into the
    /// same indices of `out`. Sample `i` is read at
    /// `offset + total_byte_offset + stride * i`.
    pub(crate) fn update(
        &self,
        out: &mut [f64],
        raw: &[u8],
        offset: u64,
        sample_start: u32,
        sample_count: u32,
    ) -> Result<()> {
        let word = self
            .layout
            .native_word()
            .ok_or(Error::InternalInvariant("non-numeric field reached the decode kernel"))?;

        if sample_count == 0 {
            return Ok(());
        }

        let start = sample_start as u64;
        let end = start + sample_count as u64;
        if end > out.len() as u64 {
            return Err(Error::Window { start, end, length: out.len() });
        }

        let stride = self.layout.stride() as u64;
        let base = offset.checked_add(self.layout.total_byte_offset() as u64);
        let required = base
            .and_then(|base| stride.checked_mul(end - 1).and_then(|last| base.checked_add(last)))
            .and_then(|last| last.checked_add(word.bytes() as u64));
        let available = raw.len() as u64;
        let (base, required) = match (base, required) {
            (Some(base), Some(required)) if required <= available => (base, required),
            (_, required) => {
                return Err(Error::Bounds {
                    required: required.unwrap_or(u64::MAX),
                    available,
                })
            }
        };
        debug_assert!(required <= available);

        // Every cursor below lies in `base + stride * start ..= base + stride * (end - 1)`,
        // so each word read ends at or before `required`.
        let cursor = (base + stride * start) as usize;
        let stride = stride as usize;
        let out = &mut out[start as usize..end as usize];

        let mask = self.layout.mask();
        let shift = self.layout.shift();
        let bits = self.layout.bit_length();
        let unsigned = |w: u64| ((w & mask) >> shift) as f64;
        let signed = |w: u64| sign_extend((w & mask) >> shift, bits) as f64;

        let (scale, offset) = (self.scale, self.offset);
        match word {
            NativeWord::U8 => run(out, raw, cursor, stride, scale, offset, |w: u8| unsigned(w as u64)),
            NativeWord::U16 => run(out, raw, cursor, stride, scale, offset, |w: u16| unsigned(w as u64)),
            NativeWord::U32 => run(out, raw, cursor, stride, scale, offset, |w: u32| unsigned(w as u64)),
            NativeWord::U64 => run(out, raw, cursor, stride, scale, offset, unsigned),
            NativeWord::I8 => run(out, raw, cursor, stride, scale, offset, |w: u8| signed(w as u64)),
            NativeWord::I16 => run(out, raw, cursor, stride, scale, offset, |w: u16| signed(w as u64)),
            NativeWord::I32 => run(out, raw, cursor, stride, scale, offset, |w: u32| signed(w as u64)),
            NativeWord::I64 => run(out, raw, cursor, stride, scale, offset, signed),
            NativeWord::F32 => run(out, raw, cursor, stride, scale, offset, |w: f32| w as f64),
            NativeWord::F64 => run(out, raw, cursor, stride, scale, offset, |w: f64| w),
        }
        Ok(())
    }
}

fn sign_extend(value: u64, bits: u32) -> i64 {
    let unused = 64 - bits;
    ((value << unused) as i64) >> unused
}

/// The caller guarantees `cursor + stride * (out.len() - 1) + size_of::<W>() <= raw.len()`.
#[inline(always)]
fn run<W: Copy>(
    out: &mut [f64],
    raw: &[u8],
    mut cursor: usize,
    stride: usize,
    scale: f64,
    offset: f64,
    to_f64: impl Fn(W) -> f64,
) {
    let base = raw.as_ptr();
    for slot in out.iter_mut() {
        debug_assert!(cursor + size_of::<W>() <= raw.len());
        // SAFETY: bounds of the whole window were checked in `update`; the
        // read is unaligned and `W` is a plain integer or float.
        let word = unsafe { ptr::read_unaligned(base.add(cursor).cast::<W>()) };
        *slot = to_f64(word) * scale + offset;
        cursor += stride;
    }
}
