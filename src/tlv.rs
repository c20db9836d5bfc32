// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Utilities for dealing with BER-TLV (Tag-Length-Value) encoded data objects

/// Returns (tag, data, remainder)
pub fn take_do(data: &[u8]) -> Option<(u16, &[u8], &[u8])> {
    let (tag, remainder) = take_tag(data)?;
    let (len, remainder) = take_len(remainder)?;
    if remainder.len() < len {
        warn!(
            "Tried to parse TLV with data length shorter that the length data: {} < {}",
            remainder.len(),
            len
        );
        None
    } else {
        let (value, remainder) = remainder.split_at(len);
        Some((tag, value, remainder))
    }
}

// See
// https://www.emvco.com/wp-content/uploads/2017/05/EMV_v4.3_Book_3_Application_Specification_20120607062110791.pdf
// Annex B1
fn take_tag(data: &[u8]) -> Option<(u16, &[u8])> {
    let b1 = *data.first()?;
    if (b1 & 0x1f) == 0x1f {
        let b2 = *data.get(1)?;

        if (b2 & 0b10000000) != 0 {
            // Three byte tags (5FC1xx) only appear as values of '5C', never as data object tags
            warn!("Got a tag larger than 2 bytes: {:02x?}", &data[..2]);
            return None;
        }
        Some((u16::from_be_bytes([b1, b2]), &data[2..]))
    } else {
        Some((u16::from_be_bytes([0, b1]), &data[1..]))
    }
}

pub fn take_len(data: &[u8]) -> Option<(usize, &[u8])> {
    let l1 = *data.first()?;
    if l1 <= 0x7F {
        Some((l1 as usize, &data[1..]))
    } else if l1 == 0x81 {
        Some((*data.get(1)? as usize, data.get(2..)?))
    } else {
        if l1 != 0x82 {
            warn!("Got an unexpected length tag: {l1:x}");
            return None;
        }
        let l2 = *data.get(1)?;
        let l3 = *data.get(2)?;
        let len = u16::from_be_bytes([l2, l3]) as usize;
        Some((len, &data[3..]))
    }
}
