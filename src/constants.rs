// Copyright (C) 2022 Nicolas Stalder AND  Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

use hex_literal::hex;

pub const RID_LENGTH: usize = 5;

// top nibble of first byte is "category", here "A" = International
// this category has 5 byte "registered application provider identifier"
// (international RID, the other 9 nibbles is between 0x0 and 0x9).
pub const NIST_RID: &[u8; 5] = &hex!("A000000 308");

pub const PIV_PIX: [u8; 6] = hex!("0000 1000 0100");

/// Full AID, SELECT accepts any prefix of it that covers at least the RID.
pub const PIV_AID: [u8; 11] = hex!("A000000308 00001000 0100");

pub const APPLICATION_LABEL: &[u8] = b"PIV applet";
pub const APPLICATION_URL: &[u8] = b"https://csrc.nist.gov/pubs/sp/800/73/4/upd1/final";

/// Largest command data accepted, chained or extended.
pub const COMMAND_SIZE: usize = 3072;
/// Largest response a single command can produce before segmentation.
pub const RESPONSE_SIZE: usize = 3072;
/// Largest response data sent in one APDU.
pub const MAX_CHUNK: usize = 255;
/// Capacity of one data object slot (X.509 certificates are at most 1905 bytes plus framing).
pub const MAX_OBJECT_SIZE: usize = 2048;

pub const CHAINING_BIT: u8 = 0x10;
pub const SELECT_INS: u8 = 0xA4;
pub const GET_RESPONSE_INS: u8 = 0xC0;

pub const DEFAULT_PIN: [u8; 8] = *b"12345678";
pub const DEFAULT_PIN_RETRIES: u8 = 5;
/// Retry counters are reported in the low nibble of `63CX`.
pub const MAX_PIN_RETRIES: u8 = 15;

pub const DEFAULT_MANAGEMENT_KEY: &[u8; 24] = &hex!(
    "
    0102030405060708
    0102030405060708
    0102030405060708
"
);

/// Interindustry template: application AID and PIN usage policy (PIV PIN only).
pub const DISCOVERY_OBJECT: &[u8; 20] = &hex!(
    "
    7E 12
        4F 0B A0000003 08000010 000100
        5F2F 02 4000
"
);
