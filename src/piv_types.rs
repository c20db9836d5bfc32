// Copyright (C) 2022 Nicolas Stalder AND  Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

use core::convert::{TryFrom, TryInto};

use flexiber::Encodable;
use subtle::ConstantTimeEq;

#[macro_export]
macro_rules! enum_u8 {
    (
        $(#[$outer:meta])*
        $vis:vis enum $name:ident {
            $($var:ident = $num:expr),+
            $(,)*
        }
    ) => {
        $(#[$outer])*
        #[repr(u8)]
        $vis enum $name {
            $(
                $var = $num,
            )*
        }

        impl TryFrom<u8> for $name {
            type Error = ::iso7816::Status;
            fn try_from(val: u8) -> Result<Self, Self::Error> {
                match val {
                    $(
                        $num => Ok($name::$var),
                    )*
                    _ => Err(::iso7816::Status::IncorrectP1OrP2Parameter)
                }
            }
        }

        impl From<$name> for u8 {
            fn from(val: $name) -> u8 {
                val as u8
            }
        }
    }
}

/// Per SP 800-73-4, a PIN must be 6-8 digits, padded to 8 bytes with 0xFF.
///
/// We are more lenient, and allow ASCII 0x20..=0x7F.
#[derive(Clone, Copy, Eq)]
pub struct Pin {
    padded_pin: [u8; 8],
    len: usize,
}

impl Pin {
    pub fn padded(&self) -> &[u8; 8] {
        &self.padded_pin
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }
}

impl core::fmt::Debug for Pin {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pin").field("len", &self.len).finish()
    }
}

impl PartialEq for Pin {
    fn eq(&self, other: &Self) -> bool {
        self.padded_pin[..].ct_eq(&other.padded_pin[..]).into()
    }
}

impl TryFrom<&[u8]> for Pin {
    type Error = ();
    fn try_from(padded_pin: &[u8]) -> Result<Self, Self::Error> {
        let padded_pin: [u8; 8] = padded_pin.try_into().map_err(|_| ())?;
        let first_pad_byte = padded_pin.iter().position(|&b| b == 0xff);
        let unpadded_pin = match first_pad_byte {
            Some(l) => &padded_pin[..l],
            None => &padded_pin,
        };
        // everything after the first pad byte must be padding too
        if padded_pin[unpadded_pin.len()..].iter().any(|&b| b != 0xff) {
            return Err(());
        }
        match unpadded_pin.len() {
            len @ 6..=8 => {
                let verifier = if cfg!(feature = "strict-pin") {
                    |&byte| (b'0'..=b'9').contains(&byte)
                } else {
                    |&byte| (32..=127).contains(&byte)
                };
                if unpadded_pin.iter().all(verifier) {
                    Ok(Pin { padded_pin, len })
                } else {
                    Err(())
                }
            }
            _ => Err(()),
        }
    }
}

enum_u8! {
    #[derive(Clone, Copy, Eq, PartialEq, Debug)]
    // As additional reference, see:
    // https://globalplatform.org/wp-content/uploads/2014/03/GPC_ISO_Framework_v1.0.pdf#page=15
    pub enum Algorithms {
        Tdes = 0x3,
        Rsa1024 = 0x6,
        Rsa2048 = 0x7,
        Aes128 = 0x8,
        Aes192 = 0xA,
        Aes256 = 0xC,
        P256 = 0x11,
        P384 = 0x14,

        // non-standard!
        Rsa3072 = 0xE0,
        Rsa4096 = 0xE1,
        Ed25519 = 0xE2,
        X25519 = 0xE3,
    }
}

crate::container::enum_subset! {
    #[derive(Debug)]
    pub enum AsymmetricAlgorithms: Algorithms {
        #[cfg(feature = "rsa")]
        Rsa2048,
        P256,
    }
}

impl AsymmetricAlgorithms {
    /// Map a recognized algorithm to one this backend can generate.
    ///
    /// Algorithms that are valid PIV identifiers but not implemented give `FunctionNotSupported`.
    pub fn supported(alg: Algorithms) -> Result<Self, iso7816::Status> {
        Self::try_from(alg).map_err(|_| {
            warn!("Unsupported algorithm: {:?}", alg);
            iso7816::Status::FunctionNotSupported
        })
    }
}

/// Body of the `AC` template of the SELECT response
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct CryptographicAlgorithmTemplate<'a> {
    pub algorithms: &'a [Algorithms],
}

impl Encodable for CryptographicAlgorithmTemplate<'_> {
    fn encoded_length(&self) -> flexiber::Result<flexiber::Length> {
        Ok(((3usize * (self.algorithms.len() + 1)) as u16).into())
    }

    fn encode(&self, encoder: &mut flexiber::Encoder<'_>) -> flexiber::Result<()> {
        // '80'
        let cryptographic_algorithm_identifier_tag = flexiber::Tag::context(0);
        for alg in self.algorithms.iter() {
            encoder.encode(&flexiber::TaggedSlice::from(
                cryptographic_algorithm_identifier_tag,
                &[*alg as _],
            )?)?;
        }
        // '06'
        let object_identifier_tag = flexiber::Tag::universal(6);
        encoder.encode(&flexiber::TaggedSlice::from(
            object_identifier_tag,
            &[0x00],
        )?)
    }
}

#[derive(Clone, Copy, Encodable, Eq, PartialEq)]
pub struct CoexistentTagAllocationAuthorityTemplate<'l> {
    #[tlv(application, primitive, number = "0xF")] // = 0x4F
    pub application_identifier: &'l [u8],
}

impl Default for CoexistentTagAllocationAuthorityTemplate<'static> {
    fn default() -> Self {
        Self {
            application_identifier: crate::constants::NIST_RID,
        }
    }
}

#[derive(Clone, Copy, Encodable, Eq, PartialEq)]
#[tlv(application, constructed, number = "0x1")] // = 0x61
pub struct ApplicationPropertyTemplate<'l> {
    /// Application identifier of application: PIX (without RID, with version)
    #[tlv(application, primitive, number = "0xF")] // = 0x4F
    aid: &'l [u8],

    /// Text describing the application; e.g., for use on a man-machine interface.
    #[tlv(application, primitive, number = "0x10")] // = 0x50
    application_label: &'l [u8],

    /// Reference to the specification describing the application.
    #[tlv(application, primitive, number = "0x50")] // = 0x5F50
    application_url: &'l [u8],

    #[tlv(context, constructed, number = "0xC")] // = 0xAC
    supported_cryptographic_algorithms: CryptographicAlgorithmTemplate<'l>,

    #[tlv(application, constructed, number = "0x19")] // = 0x79
    coexistent_tag_allocation_authority: CoexistentTagAllocationAuthorityTemplate<'l>,
}

impl Default for ApplicationPropertyTemplate<'static> {
    fn default() -> Self {
        Self {
            aid: &crate::constants::PIV_PIX,
            application_label: &[],
            application_url: &[],
            supported_cryptographic_algorithms: Default::default(),
            coexistent_tag_allocation_authority: Default::default(),
        }
    }
}

impl<'a> ApplicationPropertyTemplate<'a> {
    pub const fn with_application_label(self, application_label: &'a [u8]) -> Self {
        Self {
            application_label,
            ..self
        }
    }

    pub const fn with_application_url(self, application_url: &'a [u8]) -> Self {
        Self {
            application_url,
            ..self
        }
    }

    pub const fn with_supported_cryptographic_algorithms(
        self,
        supported_cryptographic_algorithms: &'a [Algorithms],
    ) -> Self {
        Self {
            supported_cryptographic_algorithms: CryptographicAlgorithmTemplate {
                algorithms: supported_cryptographic_algorithms,
            },
            ..self
        }
    }
}
