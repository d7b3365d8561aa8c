// Copyright 2020 Joyent, Inc.

//! Conversion between native integers and the little-endian wire form.
//!
//! Every multi-byte header field and numeric payload travels little-endian
//! regardless of the host. On little-endian hosts both directions are the
//! identity; elsewhere they swap bytes.

pub trait WireEndian: Sized + Copy {
    fn to_wire(self) -> Self;
    fn from_wire(self) -> Self;
}

macro_rules! impl_wire_endian {
    ($($t:ty),*) => {
        $(
            impl WireEndian for $t {
                #[inline]
                fn to_wire(self) -> Self {
                    self.to_le()
                }

                #[inline]
                fn from_wire(self) -> Self {
                    <$t>::from_le(self)
                }
            }
        )*
    };
}

impl_wire_endian!(u16, u32, u64, i16, i32, i64);
