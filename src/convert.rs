//! Sample encoding registry and in-place conversion primitives.
//!
//! Drivers report one native encoding per channel; the registry maps each
//! encoding to an in-place conversion function plus a bit shift. Conversion
//! never resamples or rescales, it only normalizes byte order and bit
//! placement so the processor sees a canonical host format.

use crate::error::{Error, Result};
use byteorder::{ByteOrder, NativeEndian};
use serde::{Deserialize, Serialize};

/// Closed set of driver-native sample encodings.
///
/// The DSD encodings exist on the wire but carry no PCM interpretation; the
/// registry rejects them so an open fails before any buffer is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleEncoding {
    Int16Msb,
    Int16Lsb,
    Int24Msb,
    Int24Lsb,
    Int32Msb,
    Int32Lsb,
    Int32Msb16,
    Int32Msb18,
    Int32Msb20,
    Int32Msb24,
    Int32Lsb16,
    Int32Lsb18,
    Int32Lsb20,
    Int32Lsb24,
    Float32Msb,
    Float32Lsb,
    Float64Msb,
    Float64Lsb,
    DsdInt8Lsb1,
    DsdInt8Msb1,
    DsdInt8Ner8,
}

/// Canonical host-side format after in-place conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalFormat {
    I16,
    I24,
    I32,
    F32,
}

impl CanonicalFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            CanonicalFormat::I16 => 2,
            CanonicalFormat::I24 => 3,
            CanonicalFormat::I32 | CanonicalFormat::F32 => 4,
        }
    }
}

impl SampleEncoding {
    /// Bytes per sample as laid out in the driver's buffers.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleEncoding::Int16Msb | SampleEncoding::Int16Lsb => 2,
            SampleEncoding::Int24Msb | SampleEncoding::Int24Lsb => 3,
            SampleEncoding::Float64Msb | SampleEncoding::Float64Lsb => 8,
            SampleEncoding::DsdInt8Lsb1
            | SampleEncoding::DsdInt8Msb1
            | SampleEncoding::DsdInt8Ner8 => 1,
            _ => 4,
        }
    }

    fn big_endian(self) -> bool {
        matches!(
            self,
            SampleEncoding::Int16Msb
                | SampleEncoding::Int24Msb
                | SampleEncoding::Int32Msb
                | SampleEncoding::Int32Msb16
                | SampleEncoding::Int32Msb18
                | SampleEncoding::Int32Msb20
                | SampleEncoding::Int32Msb24
                | SampleEncoding::Float32Msb
                | SampleEncoding::Float64Msb
                | SampleEncoding::DsdInt8Msb1
        )
    }

    /// Whether the byte order differs from the host's.
    fn foreign(self) -> bool {
        self.big_endian() == cfg!(target_endian = "little")
    }

    fn shift_bits(self) -> Option<u32> {
        match self {
            SampleEncoding::Int32Msb16 | SampleEncoding::Int32Lsb16 => Some(16),
            SampleEncoding::Int32Msb18 | SampleEncoding::Int32Lsb18 => Some(14),
            SampleEncoding::Int32Msb20 | SampleEncoding::Int32Lsb20 => Some(12),
            SampleEncoding::Int32Msb24 | SampleEncoding::Int32Lsb24 => Some(8),
            _ => None,
        }
    }
}

/// In-place converter over a raw half buffer. Arguments are the buffer, the
/// bit shift, and the sample count.
pub type ConvertFn = fn(&mut [u8], u32, usize);

/// Result of a registry lookup.
#[derive(Clone, Copy)]
pub struct ConverterSpec {
    /// `None` when the native layout already matches the canonical format.
    pub convert: Option<ConvertFn>,
    pub shift: u32,
    pub format: CanonicalFormat,
}

/// Select the device-to-host converter applied to input slots.
pub fn device_to_host(encoding: SampleEncoding) -> Result<ConverterSpec> {
    let foreign = encoding.foreign();
    let spec = match encoding {
        SampleEncoding::Int16Msb | SampleEncoding::Int16Lsb => ConverterSpec {
            convert: foreign.then_some(swap16 as ConvertFn),
            shift: 0,
            format: CanonicalFormat::I16,
        },
        SampleEncoding::Int24Msb | SampleEncoding::Int24Lsb => ConverterSpec {
            convert: foreign.then_some(swap24 as ConvertFn),
            shift: 0,
            format: CanonicalFormat::I24,
        },
        SampleEncoding::Int32Msb | SampleEncoding::Int32Lsb => ConverterSpec {
            convert: foreign.then_some(swap32 as ConvertFn),
            shift: 0,
            format: CanonicalFormat::I32,
        },
        SampleEncoding::Float32Msb | SampleEncoding::Float32Lsb => ConverterSpec {
            convert: foreign.then_some(swap32 as ConvertFn),
            shift: 0,
            format: CanonicalFormat::F32,
        },
        SampleEncoding::Float64Msb | SampleEncoding::Float64Lsb => ConverterSpec {
            convert: Some(if foreign {
                swap64_f64_to_f32 as ConvertFn
            } else {
                f64_to_f32 as ConvertFn
            }),
            shift: 0,
            format: CanonicalFormat::F32,
        },
        _ => match encoding.shift_bits() {
            Some(shift) => ConverterSpec {
                convert: Some(if foreign {
                    swap_shift_left32 as ConvertFn
                } else {
                    shift_left32 as ConvertFn
                }),
                shift,
                format: CanonicalFormat::I32,
            },
            None => return Err(Error::UnsupportedSampleEncoding(encoding)),
        },
    };
    Ok(spec)
}

/// Select the host-to-device converter applied to output slots.
pub fn host_to_device(encoding: SampleEncoding) -> Result<ConverterSpec> {
    let foreign = encoding.foreign();
    let spec = match encoding {
        SampleEncoding::Int16Msb | SampleEncoding::Int16Lsb => ConverterSpec {
            convert: foreign.then_some(swap16 as ConvertFn),
            shift: 0,
            format: CanonicalFormat::I16,
        },
        SampleEncoding::Int24Msb | SampleEncoding::Int24Lsb => ConverterSpec {
            convert: foreign.then_some(swap24 as ConvertFn),
            shift: 0,
            format: CanonicalFormat::I24,
        },
        SampleEncoding::Int32Msb | SampleEncoding::Int32Lsb => ConverterSpec {
            convert: foreign.then_some(swap32 as ConvertFn),
            shift: 0,
            format: CanonicalFormat::I32,
        },
        SampleEncoding::Float32Msb | SampleEncoding::Float32Lsb => ConverterSpec {
            convert: foreign.then_some(swap32 as ConvertFn),
            shift: 0,
            format: CanonicalFormat::F32,
        },
        SampleEncoding::Float64Msb | SampleEncoding::Float64Lsb => ConverterSpec {
            convert: Some(if foreign {
                f32_to_f64_swap64 as ConvertFn
            } else {
                f32_to_f64 as ConvertFn
            }),
            shift: 0,
            format: CanonicalFormat::F32,
        },
        _ => match encoding.shift_bits() {
            Some(shift) => ConverterSpec {
                convert: Some(if foreign {
                    shift_right_swap32 as ConvertFn
                } else {
                    shift_right32 as ConvertFn
                }),
                shift,
                format: CanonicalFormat::I32,
            },
            None => return Err(Error::UnsupportedSampleEncoding(encoding)),
        },
    };
    Ok(spec)
}

fn swap16(buf: &mut [u8], _shift: u32, samples: usize) {
    for chunk in buf.chunks_exact_mut(2).take(samples) {
        chunk.swap(0, 1);
    }
}

fn swap24(buf: &mut [u8], _shift: u32, samples: usize) {
    for chunk in buf.chunks_exact_mut(3).take(samples) {
        chunk.swap(0, 2);
    }
}

fn swap32(buf: &mut [u8], _shift: u32, samples: usize) {
    for chunk in buf.chunks_exact_mut(4).take(samples) {
        let v = NativeEndian::read_u32(chunk);
        NativeEndian::write_u32(chunk, v.swap_bytes());
    }
}

fn shift_left32(buf: &mut [u8], shift: u32, samples: usize) {
    for chunk in buf.chunks_exact_mut(4).take(samples) {
        let v = NativeEndian::read_u32(chunk);
        NativeEndian::write_u32(chunk, v << shift);
    }
}

fn swap_shift_left32(buf: &mut [u8], shift: u32, samples: usize) {
    for chunk in buf.chunks_exact_mut(4).take(samples) {
        let v = NativeEndian::read_u32(chunk).swap_bytes();
        NativeEndian::write_u32(chunk, v << shift);
    }
}

fn shift_right32(buf: &mut [u8], shift: u32, samples: usize) {
    for chunk in buf.chunks_exact_mut(4).take(samples) {
        let v = NativeEndian::read_u32(chunk);
        NativeEndian::write_u32(chunk, v >> shift);
    }
}

fn shift_right_swap32(buf: &mut [u8], shift: u32, samples: usize) {
    for chunk in buf.chunks_exact_mut(4).take(samples) {
        let v = NativeEndian::read_u32(chunk) >> shift;
        NativeEndian::write_u32(chunk, v.swap_bytes());
    }
}

/// In-place f64 -> f32. Walks forward so each 4-byte write lands before the
/// next 8-byte read.
fn f64_to_f32(buf: &mut [u8], _shift: u32, samples: usize) {
    for i in 0..samples {
        let v = NativeEndian::read_f64(&buf[i * 8..i * 8 + 8]) as f32;
        NativeEndian::write_f32(&mut buf[i * 4..i * 4 + 4], v);
    }
}

fn swap64_f64_to_f32(buf: &mut [u8], _shift: u32, samples: usize) {
    for i in 0..samples {
        let bits = NativeEndian::read_u64(&buf[i * 8..i * 8 + 8]).swap_bytes();
        let v = f64::from_bits(bits) as f32;
        NativeEndian::write_f32(&mut buf[i * 4..i * 4 + 4], v);
    }
}

/// In-place f32 -> f64. Walks backward so each 8-byte write lands after the
/// remaining 4-byte reads.
fn f32_to_f64(buf: &mut [u8], _shift: u32, samples: usize) {
    for i in (0..samples).rev() {
        let v = NativeEndian::read_f32(&buf[i * 4..i * 4 + 4]) as f64;
        NativeEndian::write_f64(&mut buf[i * 8..i * 8 + 8], v);
    }
}

fn f32_to_f64_swap64(buf: &mut [u8], _shift: u32, samples: usize) {
    for i in (0..samples).rev() {
        let v = NativeEndian::read_f32(&buf[i * 4..i * 4 + 4]) as f64;
        NativeEndian::write_u64(&mut buf[i * 8..i * 8 + 8], v.to_bits().swap_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, LittleEndian};

    fn native_encoding_32() -> SampleEncoding {
        if cfg!(target_endian = "little") {
            SampleEncoding::Int32Lsb
        } else {
            SampleEncoding::Int32Msb
        }
    }

    fn foreign_encoding_32() -> SampleEncoding {
        if cfg!(target_endian = "little") {
            SampleEncoding::Int32Msb
        } else {
            SampleEncoding::Int32Lsb
        }
    }

    #[test]
    fn native_int32_needs_no_converter() {
        let spec = device_to_host(native_encoding_32()).unwrap();
        assert!(spec.convert.is_none());
        assert_eq!(spec.shift, 0);
        assert_eq!(spec.format, CanonicalFormat::I32);
    }

    #[test]
    fn foreign_int32_swaps_in_place() {
        let spec = device_to_host(foreign_encoding_32()).unwrap();
        let convert = spec.convert.unwrap();

        let mut buf = [0u8; 8];
        BigEndian::write_i32(&mut buf[0..4], 0x0102_0304);
        BigEndian::write_i32(&mut buf[4..8], -5);
        if cfg!(target_endian = "big") {
            buf.swap(0, 3);
            buf.swap(1, 2);
            buf[4..8].swap(0, 3);
            buf[4..8].swap(1, 2);
        }
        convert(&mut buf, spec.shift, 2);

        assert_eq!(NativeEndian::read_i32(&buf[0..4]), 0x0102_0304);
        assert_eq!(NativeEndian::read_i32(&buf[4..8]), -5);
    }

    #[test]
    fn shifted_int32_expands_and_restores() {
        let native = if cfg!(target_endian = "little") {
            SampleEncoding::Int32Lsb16
        } else {
            SampleEncoding::Int32Msb16
        };

        let to_host = device_to_host(native).unwrap();
        let to_device = host_to_device(native).unwrap();
        assert_eq!(to_host.shift, 16);
        assert_eq!(to_device.shift, 16);

        // Device delivers a 16-bit value in the low bits of a 32-bit word.
        let mut buf = [0u8; 4];
        NativeEndian::write_u32(&mut buf, 0x0000_1234);
        (to_host.convert.unwrap())(&mut buf, to_host.shift, 1);
        assert_eq!(NativeEndian::read_u32(&buf), 0x1234_0000);

        (to_device.convert.unwrap())(&mut buf, to_device.shift, 1);
        assert_eq!(NativeEndian::read_u32(&buf), 0x0000_1234);
    }

    #[test]
    fn float64_converts_to_float32_in_place() {
        let native = if cfg!(target_endian = "little") {
            SampleEncoding::Float64Lsb
        } else {
            SampleEncoding::Float64Msb
        };
        let spec = device_to_host(native).unwrap();
        assert_eq!(spec.format, CanonicalFormat::F32);

        let mut buf = [0u8; 24];
        NativeEndian::write_f64(&mut buf[0..8], 0.5);
        NativeEndian::write_f64(&mut buf[8..16], -0.25);
        NativeEndian::write_f64(&mut buf[16..24], 1.0);
        (spec.convert.unwrap())(&mut buf, 0, 3);

        assert_eq!(NativeEndian::read_f32(&buf[0..4]), 0.5);
        assert_eq!(NativeEndian::read_f32(&buf[4..8]), -0.25);
        assert_eq!(NativeEndian::read_f32(&buf[8..12]), 1.0);
    }

    #[test]
    fn float32_expands_to_float64_in_place() {
        let native = if cfg!(target_endian = "little") {
            SampleEncoding::Float64Lsb
        } else {
            SampleEncoding::Float64Msb
        };
        let spec = host_to_device(native).unwrap();

        let mut buf = [0u8; 16];
        NativeEndian::write_f32(&mut buf[0..4], 0.75);
        NativeEndian::write_f32(&mut buf[4..8], -1.0);
        (spec.convert.unwrap())(&mut buf, 0, 2);

        assert_eq!(NativeEndian::read_f64(&buf[0..8]), 0.75);
        assert_eq!(NativeEndian::read_f64(&buf[8..16]), -1.0);
    }

    #[test]
    fn foreign_float64_swaps_before_narrowing() {
        let foreign = if cfg!(target_endian = "little") {
            SampleEncoding::Float64Msb
        } else {
            SampleEncoding::Float64Lsb
        };
        let spec = device_to_host(foreign).unwrap();

        let mut buf = [0u8; 8];
        if cfg!(target_endian = "little") {
            BigEndian::write_f64(&mut buf, 0.125);
        } else {
            LittleEndian::write_f64(&mut buf, 0.125);
        }
        (spec.convert.unwrap())(&mut buf, 0, 1);
        assert_eq!(NativeEndian::read_f32(&buf[0..4]), 0.125);
    }

    #[test]
    fn swap24_reverses_triplets() {
        let mut buf = [1u8, 2, 3, 4, 5, 6];
        swap24(&mut buf, 0, 2);
        assert_eq!(buf, [3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn dsd_encodings_are_rejected() {
        for enc in [
            SampleEncoding::DsdInt8Lsb1,
            SampleEncoding::DsdInt8Msb1,
            SampleEncoding::DsdInt8Ner8,
        ] {
            assert!(matches!(
                device_to_host(enc),
                Err(Error::UnsupportedSampleEncoding(_))
            ));
            assert!(matches!(
                host_to_device(enc),
                Err(Error::UnsupportedSampleEncoding(_))
            ));
        }
    }

    #[test]
    fn registry_covers_every_pcm_encoding() {
        for enc in [
            SampleEncoding::Int16Msb,
            SampleEncoding::Int16Lsb,
            SampleEncoding::Int24Msb,
            SampleEncoding::Int24Lsb,
            SampleEncoding::Int32Msb,
            SampleEncoding::Int32Lsb,
            SampleEncoding::Int32Msb16,
            SampleEncoding::Int32Msb18,
            SampleEncoding::Int32Msb20,
            SampleEncoding::Int32Msb24,
            SampleEncoding::Int32Lsb16,
            SampleEncoding::Int32Lsb18,
            SampleEncoding::Int32Lsb20,
            SampleEncoding::Int32Lsb24,
            SampleEncoding::Float32Msb,
            SampleEncoding::Float32Lsb,
            SampleEncoding::Float64Msb,
            SampleEncoding::Float64Lsb,
        ] {
            device_to_host(enc).unwrap();
            host_to_device(enc).unwrap();
        }
    }
}
