// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! A complete personalization and use of the card, as a host middleware would drive it.

#![cfg(feature = "rsa")]

mod setup;

use hex_literal::hex;
use p256::ecdsa::{signature::hazmat::PrehashVerifier, Signature, VerifyingKey};
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use setup::{authenticate_management, build_command, exchange, tlv, transmit, transmit_chained};
use sha2::{Digest, Sha256};
use test_log::test;

const SHA256_PREFIX: [u8; 19] = hex!("3031300d060960864801650304020105000420");

fn pkcs1v15_block(digest: &[u8]) -> Vec<u8> {
    let mut payload = SHA256_PREFIX.to_vec();
    payload.extend_from_slice(digest);
    let mut block = vec![0xFF; 256];
    block[0] = 0x00;
    block[1] = 0x01;
    block[256 - payload.len() - 1] = 0x00;
    block[256 - payload.len()..].copy_from_slice(&payload);
    block
}

fn sign_template(data: &[u8]) -> Vec<u8> {
    let mut inner = hex!("82 00").to_vec();
    inner.extend_from_slice(&tlv(&[0x81], data));
    tlv(&[0x7C], &inner)
}

fn put_data(tag: &[u8], value: &[u8]) -> Vec<u8> {
    let mut data = tlv(&[0x5C], tag);
    data.extend_from_slice(&tlv(&[0x53], value));
    data
}

#[test]
fn personalize_and_use() {
    setup::piv(setup::DEFAULT, |piv| {
        // SELECT with the RID only
        let (response, sw) = exchange(piv, &hex!("00 A4 04 00 05 A000000308"));
        assert_eq!(sw, 0x9000);
        assert_eq!(&response[..4], &hex!("61 62 4F 06"));

        authenticate_management(piv);

        // RSA-2048 PIV authentication key
        let (public, sw) = transmit(piv, &hex!("00 47 00 9A 05 AC 03 80 01 07"));
        assert_eq!(sw, 0x9000);
        assert_eq!(&public[5..9], &hex!("81 82 01 00"));
        assert_eq!(&public[265..267], &hex!("82 03"));
        let rsa_key = RsaPublicKey::new(
            BigUint::from_bytes_be(&public[9..265]),
            BigUint::from_bytes_be(&public[267..]),
        )
        .unwrap();

        assert_eq!(exchange(piv, &setup::VERIFY_DEFAULT_PIN), (vec![], 0x9000));

        // Chained RSA signature
        let digest = Sha256::digest(b"PIV authentication");
        let (response, sw) = transmit_chained(
            piv,
            0x87,
            0x07,
            0x9A,
            &sign_template(&pkcs1v15_block(&digest)),
            0xF0,
        );
        assert_eq!(sw, 0x9000);
        assert_eq!(&response[..8], &hex!("7C 82 0104 82 82 0100"));
        rsa_key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &response[8..])
            .unwrap();

        // Certificate for 9A, chained upload and segmented download
        let certificate: Vec<u8> = (0..900u16).map(|i| i as u8).collect();
        let mut value = tlv(&[0x70], &certificate);
        value.extend_from_slice(&hex!("71 01 00 FE 00"));
        let (_, sw) = transmit_chained(piv, 0xDB, 0x3F, 0xFF, &put_data(&hex!("5FC105"), &value), 0xFF);
        assert_eq!(sw, 0x9000);
        let (response, sw) = transmit(piv, &hex!("00 CB 3F FF 05 5C 03 5FC105 00"));
        assert_eq!(sw, 0x9000);
        assert_eq!(response, tlv(&[0x53], &value));

        // P-256 digital signature key
        let (public, sw) = transmit(piv, &hex!("00 47 00 9C 05 AC 03 80 01 11"));
        assert_eq!(sw, 0x9000);
        let ec_key = VerifyingKey::from_sec1_bytes(&public[5..]).unwrap();
        let digest = Sha256::digest(b"digital signature");
        let (response, sw) = transmit(
            piv,
            &build_command(0x00, 0x87, 0x11, 0x9C, &sign_template(&digest), 0),
        );
        assert_eq!(sw, 0x9000);
        assert_eq!(response[0], 0x7C);
        assert_eq!(response[2], 0x82);
        let signature = Signature::from_der(&response[4..]).unwrap();
        ec_key.verify_prehash(&digest, &signature).unwrap();

        let value = tlv(&[0x70], &[0x30; 300]);
        let (_, sw) = transmit_chained(piv, 0xDB, 0x3F, 0xFF, &put_data(&hex!("5FC10A"), &value), 0xFF);
        assert_eq!(sw, 0x9000);
        let (response, sw) = transmit(piv, &hex!("00 CB 3F FF 05 5C 03 5FC10A"));
        assert_eq!((response, sw), (tlv(&[0x53], &value), 0x9000));

        // Card capability container and CHUID
        let ccc = hex!("F015A000000116FF02000000000000000000000000 F101 21 F201 21 F300 F400 F50110 F600 F700 FA00 FB00 FC00 FD00 FE00");
        assert_eq!(
            transmit(piv, &build_command(0x00, 0xDB, 0x3F, 0xFF, &put_data(&hex!("5FC107"), &ccc), 0)),
            (vec![], 0x9000)
        );
        let chuid = hex!("3019 D4E739DA739CED39CE739D836858210842108421C84210C3EB 3410 00112233445566778899AABBCCDDEEFF 3508 20301231 3E00 FE00");
        assert_eq!(
            transmit(piv, &build_command(0x00, 0xDB, 0x3F, 0xFF, &put_data(&hex!("5FC102"), &chuid), 0)),
            (vec![], 0x9000)
        );
        assert_eq!(
            transmit(piv, &hex!("00 CB 3F FF 05 5C 03 5FC102")),
            (tlv(&[0x53], &chuid), 0x9000)
        );

        // CHANGE REFERENCE DATA, the old PIN no longer works
        assert_eq!(
            exchange(piv, &hex!("00 24 00 80 10 3132333435363738 3837363534333231")),
            (vec![], 0x9000)
        );
        assert_eq!(exchange(piv, &setup::VERIFY_DEFAULT_PIN), (vec![], 0x63C4));

        // 9F is not a key reference of this card
        assert_eq!(
            exchange(piv, &hex!("00 47 00 9F 05 AC 03 80 01 11")),
            (vec![], 0x6A86)
        );
    });
}

#[test]
fn fresh_card_pin() {
    setup::piv(setup::DEFAULT, |piv| {
        assert_eq!(exchange(piv, &setup::SELECT).1, 0x9000);
        assert_eq!(
            exchange(piv, &hex!("00 20 00 80 08 3132333435363731")),
            (vec![], 0x63C4)
        );
        assert_eq!(exchange(piv, &setup::VERIFY_DEFAULT_PIN), (vec![], 0x9000));
    });
}
