//! Module `codec` implement the fixed-size binary serialization used
//! by every persisted structure in this package.
//!
//! The encoding rules are deliberately boring:
//!
//! * Integers are fixed-width big-endian, signed integers in two's
//!   complement.
//! * Floats are bit-cast to the same-size unsigned integer and then
//!   serialized big-endian.
//! * `bool` is one byte, 0 or 1.
//! * Arrays and tuples are the concatenation of their element
//!   representations, without padding.
//! * `Option<T>` is a one-byte tag, 0 absent and 1 present, followed
//!   by a fixed payload slot of `T::SIZE` bytes.
//! * Composite records concatenate their fields in declaration order;
//!   they implement [Codec] by hand, field by field.
//! * Tagged unions use a one-byte tag (the alternative index, bounded
//!   at 16) followed by a payload slot padded to the largest
//!   alternative.
//!
//! Every implementation has a serialized size known at compile time,
//! so block layouts can be computed without touching disk. Variable
//! length data never goes through this module, it lives in the blob
//! heap.

use std::convert::TryInto;

use crate::Result;

/// Types that serialize to a fixed number of bytes.
pub trait Codec: Sized {
    /// Exact number of bytes occupied by the serialized value.
    const SIZE: usize;

    /// Serialize into `buf[..Self::SIZE]`. Panics when `buf` is too
    /// short, layouts are computed statically and a short buffer is a
    /// bug in the caller.
    fn encode(&self, buf: &mut [u8]);

    /// Deserialize from `buf[..Self::SIZE]`. Fails with
    /// [crate::Error::Corruption] when the bytes do not form a valid
    /// value.
    fn decode(buf: &[u8]) -> Result<Self>;
}

/// Serialize `val` into a freshly allocated vector of `T::SIZE` bytes.
pub fn to_bytes<T: Codec>(val: &T) -> Vec<u8> {
    let mut buf = vec![0; T::SIZE];
    val.encode(&mut buf);
    buf
}

macro_rules! codec_for_int {
    ($($t:ty),+) => {$(
        impl Codec for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            fn encode(&self, buf: &mut [u8]) {
                buf[..Self::SIZE].copy_from_slice(&self.to_be_bytes());
            }

            fn decode(buf: &[u8]) -> Result<Self> {
                let bytes = match buf[..Self::SIZE].try_into() {
                    Ok(bytes) => bytes,
                    Err(err) => return err_at!(Fatal, msg: "{}", err),
                };
                Ok(<$t>::from_be_bytes(bytes))
            }
        }
    )+};
}

codec_for_int!(u8, u16, u32, u64, i8, i16, i32, i64);

impl Codec for bool {
    const SIZE: usize = 1;

    fn encode(&self, buf: &mut [u8]) {
        buf[0] = u8::from(*self);
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        match buf[0] {
            0 => Ok(false),
            1 => Ok(true),
            n => err_at!(Corruption, msg: "bool byte {}", n),
        }
    }
}

impl Codec for f32 {
    const SIZE: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        self.to_bits().encode(buf)
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(f32::from_bits(u32::decode(buf)?))
    }
}

impl Codec for f64 {
    const SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        self.to_bits().encode(buf)
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(f64::from_bits(u64::decode(buf)?))
    }
}

impl<T, const N: usize> Codec for [T; N]
where
    T: Codec + Copy + Default,
{
    const SIZE: usize = T::SIZE * N;

    fn encode(&self, buf: &mut [u8]) {
        for (i, item) in self.iter().enumerate() {
            item.encode(&mut buf[i * T::SIZE..]);
        }
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        let mut arr = [T::default(); N];
        for (i, item) in arr.iter_mut().enumerate() {
            *item = T::decode(&buf[i * T::SIZE..])?;
        }
        Ok(arr)
    }
}

impl<A, B> Codec for (A, B)
where
    A: Codec,
    B: Codec,
{
    const SIZE: usize = A::SIZE + B::SIZE;

    fn encode(&self, buf: &mut [u8]) {
        self.0.encode(buf);
        self.1.encode(&mut buf[A::SIZE..]);
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        Ok((A::decode(buf)?, B::decode(&buf[A::SIZE..])?))
    }
}

impl<A, B, C> Codec for (A, B, C)
where
    A: Codec,
    B: Codec,
    C: Codec,
{
    const SIZE: usize = A::SIZE + B::SIZE + C::SIZE;

    fn encode(&self, buf: &mut [u8]) {
        self.0.encode(buf);
        self.1.encode(&mut buf[A::SIZE..]);
        self.2.encode(&mut buf[A::SIZE + B::SIZE..]);
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        Ok((
            A::decode(buf)?,
            B::decode(&buf[A::SIZE..])?,
            C::decode(&buf[A::SIZE + B::SIZE..])?,
        ))
    }
}

impl<T> Codec for Option<T>
where
    T: Codec,
{
    const SIZE: usize = 1 + T::SIZE;

    fn encode(&self, buf: &mut [u8]) {
        match self {
            Some(val) => {
                buf[0] = 1;
                val.encode(&mut buf[1..]);
            }
            None => {
                buf[0] = 0;
                buf[1..Self::SIZE].iter_mut().for_each(|b| *b = 0);
            }
        }
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        match buf[0] {
            0 => Ok(None),
            1 => Ok(Some(T::decode(&buf[1..])?)),
            n => err_at!(Corruption, msg: "option tag {}", n),
        }
    }
}

#[cfg(test)]
#[path = "codec_test.rs"]
mod codec_test;
