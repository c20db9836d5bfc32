// Copyright (C) 2022 Nicolas Stalder AND  Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

#![allow(unused)]

use des::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use hex_literal::hex;
use piv_applet::{constants::DEFAULT_MANAGEMENT_KEY, Card, Options};
use rand_core::{OsRng, RngCore};

pub const COMMAND_SIZE: usize = 3072;

#[macro_export]
macro_rules! cmd {
    ($tt:tt) => {
        iso7816::Command::<3072>::try_from(&hex_literal::hex!($tt)).unwrap()
    };
}

pub type Piv = Card<OsRng>;

pub const DEFAULT: Options = Options::new();

pub fn piv<R>(options: Options, test: impl FnOnce(&mut Piv) -> R) -> R {
    let mut card = Card::new(options, OsRng);
    test(&mut card)
}

pub const SELECT: [u8; 10] = hex!("00 A4 04 00 05 A000000308");
pub const VERIFY_DEFAULT_PIN: [u8; 13] = hex!("00 20 00 80 08 3132333435363738");

fn serialize_len(len: usize) -> Vec<u8> {
    if let Ok(len) = u8::try_from(len) {
        if len <= 0x7f {
            vec![len]
        } else {
            vec![0x81, len]
        }
    } else {
        let len: u16 = len.try_into().unwrap();
        let arr = len.to_be_bytes();
        vec![0x82, arr[0], arr[1]]
    }
}

pub fn tlv(tag: &[u8], data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::from(tag);
    buf.extend_from_slice(&serialize_len(data.len()));
    buf.extend_from_slice(data);
    buf
}

pub fn build_command(cla: u8, ins: u8, p1: u8, p2: u8, data: &[u8], le: u16) -> Vec<u8> {
    let mut res = vec![cla, ins, p1, p2];
    let lc = data.len();
    let extended = if lc == 0 {
        false
    } else if let Ok(len) = lc.try_into() {
        res.push(len);
        false
    } else {
        let len: u16 = lc.try_into().unwrap();
        res.push(0);
        res.extend_from_slice(&len.to_be_bytes());
        true
    };

    res.extend_from_slice(data);

    if le == 0 {
        return res;
    }

    if let Ok(len) = (le - 1).try_into() {
        let _: u8 = len;
        res.push(len.wrapping_add(1));
    } else if extended {
        res.extend_from_slice(&le.to_be_bytes());
    } else {
        res.push(0);
        res.extend_from_slice(&le.to_be_bytes());
    }

    res
}

/// Send one APDU, return the data and the status word
pub fn exchange(card: &mut Piv, apdu: &[u8]) -> (Vec<u8>, u16) {
    let response = card.handle_apdu(apdu);
    let (data, sw) = response.split_at(response.len() - 2);
    (data.to_vec(), u16::from_be_bytes([sw[0], sw[1]]))
}

/// Send one APDU and collect the complete response with GET RESPONSE
pub fn transmit(card: &mut Piv, apdu: &[u8]) -> (Vec<u8>, u16) {
    let (mut data, mut sw) = exchange(card, apdu);
    while sw & 0xFF00 == 0x6100 {
        let (more, next) = exchange(card, &hex!("00 C0 00 00 00"));
        data.extend_from_slice(&more);
        sw = next;
    }
    (data, sw)
}

/// Send `data` in chunks of at most `chunk` bytes with command chaining, and collect the response
pub fn transmit_chained(
    card: &mut Piv,
    ins: u8,
    p1: u8,
    p2: u8,
    data: &[u8],
    chunk: usize,
) -> (Vec<u8>, u16) {
    let mut chunks = data.chunks(chunk).peekable();
    while let Some(part) = chunks.next() {
        if chunks.peek().is_none() {
            return transmit(card, &build_command(0x00, ins, p1, p2, part, 0));
        }
        let (response, sw) = exchange(card, &build_command(0x10, ins, p1, p2, part, 0));
        assert_eq!(sw, 0x9000, "Chained command failed");
        assert!(response.is_empty());
    }
    transmit(card, &build_command(0x00, ins, p1, p2, &[], 0))
}

fn tdes(key: &[u8]) -> des::TdesEde3 {
    des::TdesEde3::new_from_slice(key).unwrap()
}

pub fn tdes_encrypt(key: &[u8], block: &[u8]) -> Vec<u8> {
    let mut block = GenericArray::clone_from_slice(block);
    tdes(key).encrypt_block(&mut block);
    block.to_vec()
}

pub fn tdes_decrypt(key: &[u8], block: &[u8]) -> Vec<u8> {
    let mut block = GenericArray::clone_from_slice(block);
    tdes(key).decrypt_block(&mut block);
    block.to_vec()
}

/// Mutual authentication with the default 3DES management key
pub fn authenticate_management(card: &mut Piv) {
    let (response, sw) = exchange(card, &hex!("00 87 03 9B 04 7C 02 80 00"));
    assert_eq!(sw, 0x9000);
    assert_eq!(&response[..4], &hex!("7C 0A 80 08"));
    let witness = tdes_decrypt(DEFAULT_MANAGEMENT_KEY, &response[4..]);

    let mut challenge = [0; 8];
    OsRng.fill_bytes(&mut challenge);
    let mut template = tlv(&[0x80], &witness);
    template.extend_from_slice(&tlv(&[0x81], &challenge));
    let (response, sw) = exchange(
        card,
        &build_command(0x00, 0x87, 0x03, 0x9B, &tlv(&[0x7C], &template), 0),
    );
    assert_eq!(sw, 0x9000);
    assert_eq!(&response[..4], &hex!("7C 0A 82 08"));
    assert_eq!(
        response[4..],
        tdes_encrypt(DEFAULT_MANAGEMENT_KEY, &challenge)
    );
    assert!(card.authenticator().security_status().administrator_verified);
}

pub fn verify_default_pin(card: &mut Piv) {
    assert_eq!(exchange(card, &VERIFY_DEFAULT_PIN), (vec![], 0x9000));
}
