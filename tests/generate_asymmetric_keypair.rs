// Copyright (C) 2022 Nicolas Stalder AND  Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

mod setup;

use hex_literal::hex;
use iso7816::Status::*;
use setup::{authenticate_management, exchange, transmit};
use test_log::test;

// example: 00 47 00 9A 05
//   AC 03
//      # P256
//      80 01 11

#[test]
fn gen_keypair() {
    let cmd = cmd!("00 47 00 9A 05  AC 03  80 01 11");

    setup::piv(setup::DEFAULT, |piv| {
        // without the management key, no key generation
        let mut response = iso7816::Data::<16>::default();
        assert_eq!(SecurityStatusNotSatisfied, piv.respond(&cmd, &mut response));
        assert!(response.is_empty());

        authenticate_management(piv);
        let mut response = iso7816::Data::<255>::default();
        assert_eq!(Success, piv.respond(&cmd, &mut response));
        assert_eq!(&response[..6], &hex!("7F49 43 86 41 04"));
        assert_eq!(response.len(), 70);
        assert!(p256::PublicKey::from_sec1_bytes(&response[5..]).is_ok());
    });
}

#[test]
fn regenerate_overwrites() {
    setup::piv(setup::DEFAULT, |piv| {
        authenticate_management(piv);
        let (first, sw) = exchange(piv, &hex!("00 47 00 9C 05 AC 03 80 01 11"));
        assert_eq!(sw, 0x9000);
        let (second, sw) = exchange(piv, &hex!("00 47 00 9C 05 AC 03 80 01 11"));
        assert_eq!(sw, 0x9000);
        assert_ne!(first, second);
    });
}

#[cfg(feature = "rsa")]
#[test]
fn gen_rsa_keypair() {
    setup::piv(setup::DEFAULT, |piv| {
        authenticate_management(piv);
        let (first, sw) = exchange(piv, &hex!("00 47 00 9A 05 AC 03 80 01 07"));
        assert_eq!(sw, 0x610F);
        assert_eq!(first.len(), 255);
        assert_eq!(&first[..9], &hex!("7F49 82 0109 81 82 0100"));

        let (rest, sw) = exchange(piv, &hex!("00 C0 00 00 00"));
        assert_eq!(sw, 0x9000);
        assert_eq!(rest.len(), 15);
        assert_eq!(&rest[10..], &hex!("82 03 010001"));
    });
}

#[cfg(feature = "rsa")]
#[test]
fn rsa_public_key_is_usable() {
    use rsa::{traits::PublicKeyParts, BigUint, RsaPublicKey};

    setup::piv(setup::DEFAULT, |piv| {
        authenticate_management(piv);
        let (public, sw) = transmit(piv, &hex!("00 47 00 9D 05 AC 03 80 01 07"));
        assert_eq!(sw, 0x9000);
        assert_eq!(public.len(), 270);
        let n = BigUint::from_bytes_be(&public[9..9 + 256]);
        let e = BigUint::from_bytes_be(&public[9 + 256 + 2..]);
        let key = RsaPublicKey::new(n, e).unwrap();
        assert_eq!(key.size(), 256);
    });
}

#[test]
fn unsupported_algorithms() {
    setup::piv(setup::DEFAULT, |piv| {
        authenticate_management(piv);
        for alg in [0x06, 0x14, 0xE0, 0xE1, 0xE2, 0xE3] {
            let mut apdu = hex!("00 47 00 9A 05 AC 03 80 01 00");
            apdu[9] = alg;
            assert_eq!(exchange(piv, &apdu), (vec![], 0x6A81));
        }
        // symmetric algorithms are known but not asymmetric
        assert_eq!(
            exchange(piv, &hex!("00 47 00 9A 05 AC 03 80 01 03")),
            (vec![], 0x6A81)
        );
        assert_eq!(
            exchange(piv, &hex!("00 47 00 9A 05 AC 03 80 01 99")),
            (vec![], 0x6A80)
        );
        assert_eq!(
            exchange(piv, &hex!("00 47 00 9B 05 AC 03 80 01 11")),
            (vec![], 0x6A86)
        );
    });
}
