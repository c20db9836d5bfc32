// Copyright (C) 2022 Nicolas Stalder AND  Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Minimal BER-TLV reader on top of `untrusted`, for the nested templates
//! of GENERAL AUTHENTICATE ('7C') and GENERATE ASYMMETRIC KEY PAIR ('AC').
//!
//! Only single byte tags are supported, lengths use the short form or `81`/`82`.

pub use untrusted::{EndOfInput, Input, Reader};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// Input ended before the announced length
    EndOfInput,
    /// Length encoding other than short form, `81 LL` or `82 LLLL`
    UnsupportedLength,
    /// Multi byte tag (low five bits of the first byte set)
    UnsupportedTag,
    UnexpectedTag { expected: u8, actual: u8 },
}

impl From<EndOfInput> for Error {
    fn from(_: EndOfInput) -> Self {
        Error::EndOfInput
    }
}

fn read_length(input: &mut Reader<'_>) -> Result<usize, Error> {
    let first = input.read_byte()?;
    Ok(match first {
        l @ 0..=0x7F => l as usize,
        0x81 => input.read_byte()? as usize,
        0x82 => {
            let hi = input.read_byte()?;
            let lo = input.read_byte()?;
            u16::from_be_bytes([hi, lo]) as usize
        }
        _ => return Err(Error::UnsupportedLength),
    })
}

/// Read one data object and return its tag and value.
pub fn read_tag_and_get_value<'a>(input: &mut Reader<'a>) -> Result<(u8, Input<'a>), Error> {
    let tag = input.read_byte()?;
    if tag & 0x1F == 0x1F {
        return Err(Error::UnsupportedTag);
    }
    let length = read_length(input)?;
    let value = input.read_bytes(length)?;
    Ok((tag, value))
}

/// Read one data object, failing if its tag is not `tag`.
pub fn expect_tag_and_get_value<'a>(input: &mut Reader<'a>, tag: u8) -> Result<Input<'a>, Error> {
    let (actual, value) = read_tag_and_get_value(input)?;
    if actual != tag {
        return Err(Error::UnexpectedTag {
            expected: tag,
            actual,
        });
    }
    Ok(value)
}

/// Read a constructed data object with tag `tag` and decode its whole value with `decoder`.
///
/// `read_error` is returned when the object can't be read, `tag_error` when the tag doesn't match.
/// Bytes left over by `decoder` are reported as `read_error`.
pub fn nested<'a, F, R, E: Copy>(
    input: &mut Reader<'a>,
    read_error: E,
    tag_error: E,
    tag: u8,
    decoder: F,
) -> Result<R, E>
where
    F: FnOnce(&mut Reader<'a>) -> Result<R, E>,
{
    let value = expect_tag_and_get_value(input, tag).map_err(|err| match err {
        Error::UnexpectedTag { .. } => tag_error,
        _ => read_error,
    })?;
    value.read_all(read_error, decoder)
}
