//! Low-level byte order and safe reading/writing utilities for descriptor-table parsing.
//!
//! This module provides endian-aware binary data reading and writing functionality for
//! parsing a binary's static critical-section descriptor table and for patching emitted
//! code regions. It implements safe, bounds-checked operations for reading and writing
//! primitive types from/to byte buffers, preventing buffer overruns during analysis.
//!
//! # Architecture
//!
//! The module is built around the [`crate::file::io::RawIO`] trait which provides a unified
//! interface for reading and writing binary data in a type-safe manner:
//!
//! - Generic trait-based reading and writing for the primitive types the descriptor
//!   table convention uses
//! - Automatic bounds checking to prevent buffer overruns
//! - Consistent error handling through the [`crate::Result`] type
//!
//! # Usage Examples
//!
//! ```rust,ignore
//! use rseqgate::file::io::{read_le, read_le_at};
//!
//! let data = [0x01, 0x00, 0x00, 0x00];
//! let value: u32 = read_le(&data)?;
//! assert_eq!(value, 1);
//!
//! let mut offset = 0;
//! let value: u16 = read_le_at(&data, &mut offset)?;
//! assert_eq!(value, 1);
//! assert_eq!(offset, 2);
//! # Ok::<(), rseqgate::Error>(())
//! ```

use crate::{Error::OutOfBounds, Result};

/// Trait for types that can be read from and written to byte buffers in an endian-aware way.
///
/// The trait is implemented for the primitive integer types that appear in the static
/// descriptor table convention and in emitted-region patching. All conversions are
/// infallible once the byte slice has been bounds-checked by the free functions below.
pub trait RawIO: Sized {
    /// Number of bytes this type occupies in its serialized form.
    const SIZE: usize;

    /// Convert from little-endian bytes. The slice is exactly [`Self::SIZE`] long.
    fn from_le_bytes(data: &[u8]) -> Self;

    /// Write this value as little-endian bytes into the slice, which is exactly
    /// [`Self::SIZE`] long.
    fn to_le_bytes_into(self, data: &mut [u8]);
}

macro_rules! impl_raw_io {
    ($($ty:ty),*) => {
        $(
            impl RawIO for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn from_le_bytes(data: &[u8]) -> Self {
                    let mut buffer = [0_u8; std::mem::size_of::<$ty>()];
                    buffer.copy_from_slice(data);
                    <$ty>::from_le_bytes(buffer)
                }

                fn to_le_bytes_into(self, data: &mut [u8]) {
                    data.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_raw_io!(u8, i8, u16, i16, u32, i32, u64, i64);

/// Read a value of type `T` from the start of the buffer in little-endian format.
///
/// ## Arguments
/// * 'data' - The buffer to read from
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the buffer is shorter than `T::SIZE`.
pub fn read_le<T: RawIO>(data: &[u8]) -> Result<T> {
    if data.len() < T::SIZE {
        return Err(OutOfBounds);
    }

    Ok(T::from_le_bytes(&data[..T::SIZE]))
}

/// Read a value of type `T` at the given offset in little-endian format, advancing the offset.
///
/// ## Arguments
/// * 'data'    - The buffer to read from
/// * 'offset'  - Current read position, advanced by `T::SIZE` on success
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the read would exceed the buffer.
pub fn read_le_at<T: RawIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let Some(end) = offset.checked_add(T::SIZE) else {
        return Err(OutOfBounds);
    };

    if end > data.len() {
        return Err(OutOfBounds);
    }

    let value = T::from_le_bytes(&data[*offset..end]);
    *offset = end;
    Ok(value)
}

/// Write a value of type `T` to the start of the buffer in little-endian format.
///
/// ## Arguments
/// * 'data'  - The buffer to write into
/// * 'value' - The value to serialize
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the buffer is shorter than `T::SIZE`.
pub fn write_le<T: RawIO>(data: &mut [u8], value: T) -> Result<()> {
    if data.len() < T::SIZE {
        return Err(OutOfBounds);
    }

    value.to_le_bytes_into(&mut data[..T::SIZE]);
    Ok(())
}

/// Write a value of type `T` at the given offset in little-endian format, advancing the offset.
///
/// ## Arguments
/// * 'data'    - The buffer to write into
/// * 'offset'  - Current write position, advanced by `T::SIZE` on success
/// * 'value'   - The value to serialize
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the write would exceed the buffer.
pub fn write_le_at<T: RawIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let Some(end) = offset.checked_add(T::SIZE) else {
        return Err(OutOfBounds);
    };

    if end > data.len() {
        return Err(OutOfBounds);
    }

    value.to_le_bytes_into(&mut data[*offset..end]);
    *offset = end;
    Ok(())
}
