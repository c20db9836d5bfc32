// Copyright (C) 2022 Nicolas Stalder AND  Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

use core::convert::TryFrom;

use hex_literal::hex;

use crate::constants::DISCOVERY_OBJECT;

macro_rules! enum_subset {
    (

        $(#[$outer:meta])*
        $vis:vis enum $name:ident: $sup:ident {
            $($(#[cfg($inner:meta)])? $var:ident),+
            $(,)*
        }
    ) => {
        $(#[$outer])*
        #[repr(u8)]
        #[derive(Clone, Copy)]
        $vis enum $name {
            $(
                $(#[cfg($inner)])?
                $var,
            )*
        }

        impl TryFrom<$sup> for $name
        {
            type Error = ::iso7816::Status;
            fn try_from(val: $sup) -> ::core::result::Result<Self, Self::Error> {
                match val {
                    $(
                        $(#[cfg($inner)])?
                        $sup::$var => Ok($name::$var),
                    )*
                    #[allow(unreachable_patterns)]
                    _ => Err(::iso7816::Status::IncorrectP1OrP2Parameter)
                }
            }
        }

        impl From<$name> for $sup
        {
            fn from(v: $name) -> $sup {
                match v {
                    $(
                        $(#[cfg($inner)])?
                        $name::$var => $sup::$var,
                    )*
                }
            }
        }

        impl<T: Copy + Into<$sup>> PartialEq<T> for $name {
            fn eq(&self, other: &T) -> bool {
                match (self,(*other).into()) {
                    $(
                        $(#[cfg($inner)])?
                        ($name::$var, $sup::$var) => true,
                    )*
                    _ => false
                }
            }
        }

        impl Eq for $name {}

        impl TryFrom<u8> for $name {
            type Error = ::iso7816::Status;
            fn try_from(tag: u8) -> ::core::result::Result<Self, Self::Error> {
                let v: $sup = tag.try_into()?;
                v.try_into()
            }
        }

        impl $name {
            #[allow(unused)]
            pub(crate) fn all() -> &'static [Self] {
                &[
                    $(
                        $(#[cfg($inner)])?
                        Self::$var,
                    )*
                ]
            }
        }
    }
}

pub(crate) use enum_subset;

/// Security condition for the use of a given key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SecurityCondition {
    Pin,
    Always,
}

crate::enum_u8! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub enum KeyReference {
        ApplicationPin = 0x80,

        PivAuthentication = 0x9A,
        PivCardApplicationAdministration = 0x9B,
        DigitalSignature = 0x9C,
        KeyManagement = 0x9D,
        CardAuthentication = 0x9E,
    }
}

impl KeyReference {
    pub fn use_security_condition(self) -> SecurityCondition {
        match self {
            Self::CardAuthentication | Self::PivCardApplicationAdministration => {
                SecurityCondition::Always
            }
            _ => SecurityCondition::Pin,
        }
    }
}

enum_subset! {
    #[derive(Debug)]
    pub enum AsymmetricKeyReference: KeyReference {
        PivAuthentication,
        DigitalSignature,
        KeyManagement,
        CardAuthentication,
    }
}

impl AsymmetricKeyReference {
    pub fn use_security_condition(self) -> SecurityCondition {
        KeyReference::from(self).use_security_condition()
    }

    /// Position of the key in the slot table
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

pub type GenerateKeyReference = AsymmetricKeyReference;

enum_subset! {
    #[derive(Debug)]
    pub enum ChangeReferenceKeyReference: KeyReference {
        ApplicationPin,
    }
}

enum_subset! {
    #[derive(Debug)]
    pub enum VerifyKeyReference: KeyReference {
        ApplicationPin,
    }
}

enum_subset! {
    #[derive(Debug)]
    pub enum AuthenticateKeyReference: KeyReference {
        PivAuthentication,
        PivCardApplicationAdministration,
        DigitalSignature,
        KeyManagement,
        CardAuthentication,
    }
}

impl TryFrom<AuthenticateKeyReference> for AsymmetricKeyReference {
    type Error = ::iso7816::Status;
    fn try_from(val: AuthenticateKeyReference) -> Result<Self, Self::Error> {
        KeyReference::from(val).try_into()
    }
}

/// The data objects this application stores (SP 800-73-4, Part 1, Table 3).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Container {
    X509CertificateFor9E,
    CardHolderUniqueIdentifier,
    CardholderFingerprints,
    DiscoveryObject,
    X509CertificateFor9A,
    SecurityObject,
    CardCapabilityContainer,
    CardholderFacialImage,
    PrintedInformation,
    X509CertificateFor9C,
    X509CertificateFor9D,
}

// these are just the "contact" rules
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadAccessRule {
    Always,
    Pin,
}

/// One row of the object table.
#[derive(Clone, Copy, Debug)]
pub struct IndexEntry {
    pub container: Container,
    /// ContainerID of SP 800-73-4
    pub container_id: u16,
    /// BER-TLV tag used on the wire by GET DATA and PUT DATA
    pub tag: &'static [u8],
    /// Read-only value, never replaced by PUT DATA
    pub static_value: Option<&'static [u8]>,
    pub read_rule: ReadAccessRule,
}

pub const OBJECT_COUNT: usize = 11;

macro_rules! index_entry {
    ($container:ident, $id:expr, $tag:expr, $rule:ident) => {
        index_entry!($container, $id, $tag, None, $rule)
    };
    ($container:ident, $id:expr, $tag:expr, $value:expr, $rule:ident) => {{
        static ENTRY: IndexEntry = IndexEntry {
            container: Container::$container,
            container_id: $id,
            tag: &$tag,
            static_value: $value,
            read_rule: ReadAccessRule::$rule,
        };
        &ENTRY
    }};
}

impl Container {
    pub const ALL: [Container; OBJECT_COUNT] = [
        Self::X509CertificateFor9E,
        Self::CardHolderUniqueIdentifier,
        Self::CardholderFingerprints,
        Self::DiscoveryObject,
        Self::X509CertificateFor9A,
        Self::SecurityObject,
        Self::CardCapabilityContainer,
        Self::CardholderFacialImage,
        Self::PrintedInformation,
        Self::X509CertificateFor9C,
        Self::X509CertificateFor9D,
    ];

    pub fn entry(self) -> &'static IndexEntry {
        match self {
            Self::X509CertificateFor9E => {
                index_entry!(X509CertificateFor9E, 0x0500, hex!("5FC101"), Always)
            }
            Self::CardHolderUniqueIdentifier => {
                index_entry!(CardHolderUniqueIdentifier, 0x3000, hex!("5FC102"), Always)
            }
            Self::CardholderFingerprints => {
                index_entry!(CardholderFingerprints, 0x6010, hex!("5FC103"), Pin)
            }
            Self::DiscoveryObject => index_entry!(
                DiscoveryObject,
                0x6050,
                hex!("7E"),
                Some(DISCOVERY_OBJECT as &[u8]),
                Always
            ),
            Self::X509CertificateFor9A => {
                index_entry!(X509CertificateFor9A, 0x0101, hex!("5FC105"), Always)
            }
            Self::SecurityObject => index_entry!(SecurityObject, 0x9000, hex!("5FC106"), Always),
            Self::CardCapabilityContainer => {
                index_entry!(CardCapabilityContainer, 0xDB00, hex!("5FC107"), Always)
            }
            Self::CardholderFacialImage => {
                index_entry!(CardholderFacialImage, 0x6030, hex!("5FC108"), Pin)
            }
            Self::PrintedInformation => {
                index_entry!(PrintedInformation, 0x3001, hex!("5FC109"), Pin)
            }
            Self::X509CertificateFor9C => {
                index_entry!(X509CertificateFor9C, 0x0100, hex!("5FC10A"), Always)
            }
            Self::X509CertificateFor9D => {
                index_entry!(X509CertificateFor9D, 0x0102, hex!("5FC10B"), Always)
            }
        }
    }

    pub fn contact_access_rule(self) -> ReadAccessRule {
        self.entry().read_rule
    }

    pub fn is_static(self) -> bool {
        self.entry().static_value.is_some()
    }
}

impl TryFrom<&[u8]> for Container {
    type Error = ();
    fn try_from(tag: &[u8]) -> Result<Self, ()> {
        Container::ALL
            .into_iter()
            .find(|container| container.entry().tag == tag)
            .ok_or(())
    }
}
