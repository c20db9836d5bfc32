// Copyright (C) 2022 Nicolas Stalder AND  Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Parsed PIV commands.
//!
//! The types here enforce the command syntax of SP 800-73-4 Part 2 (such as padded PINs of
//! 8 bytes), but no security state checks. Those are done by the [`Authenticator`](crate::Authenticator).

use core::convert::{TryFrom, TryInto};

use iso7816::{Instruction, Status};

use crate::constants::{CHAINING_BIT, PIV_AID, RID_LENGTH};
pub use crate::{
    container::{
        self as containers, AuthenticateKeyReference, ChangeReferenceKeyReference, Container,
        GenerateKeyReference, VerifyKeyReference,
    },
    piv_types::{self, Pin},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command<'l> {
    /// Select the application
    ///
    /// Resets security indicators.
    Select(Select<'l>),
    /// Get a data object / container.
    GetData(containers::Container),
    /// Check PIN
    ///
    /// Only the PIV application PIN can be verified.
    Verify(Verify),
    /// Change PIN
    ChangeReference(ChangeReference),
    /// The most general purpose method, performing actual cryptographic operations
    ///
    /// The dynamic authentication template is parsed by the handler.
    GeneralAuthenticate(GeneralAuthenticate),
    /// Store a data object / container.
    ///
    /// The payload is only parsed once the administrator is authenticated.
    PutData,
    /// The `AC` template is parsed by the handler.
    GenerateAsymmetric(GenerateKeyReference),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GeneralAuthenticate {
    pub algorithm: piv_types::Algorithms,
    pub key_reference: AuthenticateKeyReference,
}

impl<'l> Command<'l> {
    /// Core method, constructs a PIV command, if the iso7816::Command is valid.
    ///
    /// Inherent method re-exposing the `TryFrom` implementation.
    pub fn try_from<const C: usize>(command: &'l iso7816::Command<C>) -> Result<Self, Status> {
        command.try_into()
    }

    /// Check (ins, p1, p2) as defined in the "Command Syntax" boxes of NIST SP 800-73-4,
    /// and parse the data of the commands that don't depend on the security state.
    ///
    /// Unknown instructions give `InstructionNotSupportedOrInvalid`, known instructions
    /// with bad parameters `IncorrectP1OrP2Parameter`.
    pub fn parse(instruction: Instruction, p1: u8, p2: u8, data: &'l [u8]) -> Result<Self, Status> {
        Ok(match (instruction, p1, p2) {
            (Instruction::Select, 0x04, 0x00) => Self::Select(Select::try_from(data)?),

            (Instruction::GetData, 0x3F, 0xFF) => Self::GetData(GetData::try_from(data)?.0),

            (Instruction::Verify, p1, p2) => {
                let logout = VerifyLogout::try_from(p1)?;
                let key_reference = VerifyKeyReference::try_from(p2)?;
                Self::Verify(Verify::try_from(VerifyArguments {
                    key_reference,
                    logout,
                    data,
                })?)
            }

            (Instruction::ChangeReferenceData, 0x00, p2) => {
                let key_reference = ChangeReferenceKeyReference::try_from(p2)?;
                Self::ChangeReference(ChangeReference::try_from(ChangeReferenceArguments {
                    key_reference,
                    data,
                })?)
            }

            (Instruction::GeneralAuthenticate, p1, p2) => {
                let algorithm = p1.try_into()?;
                let key_reference = AuthenticateKeyReference::try_from(p2)?;
                Self::GeneralAuthenticate(GeneralAuthenticate {
                    algorithm,
                    key_reference,
                })
            }

            (Instruction::PutData, 0x3F, 0xFF) => Self::PutData,

            (Instruction::GenerateAsymmetricKeyPair, 0x00, p2) => {
                Self::GenerateAsymmetric(GenerateKeyReference::try_from(p2)?)
            }

            (
                Instruction::Select
                | Instruction::GetData
                | Instruction::ChangeReferenceData
                | Instruction::PutData
                | Instruction::GenerateAsymmetricKeyPair,
                _,
                _,
            ) => {
                warn!("Bad parameters for {:?}: {:02x} {:02x}", instruction, p1, p2);
                return Err(Status::IncorrectP1OrP2Parameter);
            }

            _ => {
                warn!("Unsupported instruction: {:02x}", u8::from(instruction));
                return Err(Status::InstructionNotSupportedOrInvalid);
            }
        })
    }
}

/// Check the class byte of a command
///
/// Returns whether the command chaining bit is set.
pub fn check_class<const C: usize>(command: &iso7816::Command<C>) -> Result<bool, Status> {
    let class = command.class();
    if !class.secure_messaging().none() {
        warn!("Secure messaging requested: {:02x}", class.into_inner());
        return Err(Status::SecureMessagingNotSupported);
    }

    if class.channel() != Some(0) {
        warn!("Logical channel requested: {:02x}", class.into_inner());
        return Err(Status::LogicalChannelNotSupported);
    }

    Ok(class.into_inner() & CHAINING_BIT != 0)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Select<'l> {
    pub aid: &'l [u8],
}

impl<'l> TryFrom<&'l [u8]> for Select<'l> {
    type Error = Status;
    /// Any truncation of the PIV AID that still covers the RID selects the application.
    fn try_from(data: &'l [u8]) -> Result<Self, Self::Error> {
        if data.len() >= RID_LENGTH && PIV_AID.starts_with(data) {
            Ok(Self { aid: data })
        } else {
            info!("Select for other application: {:02x?}", data);
            Err(Status::NotFound)
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GetData(containers::Container);

impl TryFrom<&[u8]> for GetData {
    type Error = Status;
    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        let mut decoder = flexiber::Decoder::new(data);
        let tagged_slice: flexiber::TaggedSlice = decoder.decode().map_err(|_| {
            warn!("Malformed GET DATA: {:02x?}", data);
            Status::IncorrectDataParameter
        })?;
        if tagged_slice.tag() != flexiber::Tag::application(0x1C) {
            warn!("GET DATA without tag list: {:02x?}", data);
            return Err(Status::IncorrectDataParameter);
        }
        let container = containers::Container::try_from(tagged_slice.as_bytes()).map_err(|_| {
            warn!("GET DATA for unknown object: {:02x?}", tagged_slice.as_bytes());
            Status::NotFound
        })?;

        info!("request to GetData for container {:?}", container);
        Ok(Self(container))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VerifyLogout(bool);

impl TryFrom<u8> for VerifyLogout {
    type Error = Status;
    fn try_from(p1: u8) -> Result<Self, Self::Error> {
        match p1 {
            0x00 => Ok(Self(false)),
            0xFF => Ok(Self(true)),
            _ => Err(Status::IncorrectP1OrP2Parameter),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VerifyArguments<'l> {
    pub key_reference: VerifyKeyReference,
    pub logout: VerifyLogout,
    pub data: &'l [u8],
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verify {
    Login(Pin),
    Logout(VerifyKeyReference),
    Status(VerifyKeyReference),
}

impl TryFrom<VerifyArguments<'_>> for Verify {
    type Error = Status;
    fn try_from(arguments: VerifyArguments<'_>) -> Result<Self, Self::Error> {
        let VerifyArguments {
            key_reference,
            logout,
            data,
        } = arguments;
        Ok(match (logout.0, data.len()) {
            (false, 0) => Verify::Status(key_reference),
            (false, 8) => Verify::Login(data.try_into().map_err(|_| {
                warn!("Malformed PIN");
                Status::IncorrectDataParameter
            })?),
            (false, _len) => {
                warn!("PIN of bad length: {}", _len);
                return Err(Status::WrongLength);
            }
            (true, 0) => Verify::Logout(key_reference),
            (true, _) => return Err(Status::IncorrectDataParameter),
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChangeReferenceArguments<'l> {
    pub key_reference: ChangeReferenceKeyReference,
    pub data: &'l [u8],
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChangeReference {
    ChangePin { old_pin: Pin, new_pin: Pin },
}

impl TryFrom<ChangeReferenceArguments<'_>> for ChangeReference {
    type Error = Status;
    fn try_from(arguments: ChangeReferenceArguments<'_>) -> Result<Self, Self::Error> {
        let ChangeReferenceArguments {
            key_reference,
            data,
        } = arguments;

        if data.len() != 16 {
            warn!("CHANGE REFERENCE DATA of bad length: {}", data.len());
            return Err(Status::WrongLength);
        }
        let (old, new) = data.split_at(8);

        use ChangeReferenceKeyReference::*;
        Ok(match key_reference {
            ApplicationPin => ChangeReference::ChangePin {
                old_pin: Pin::try_from(old).map_err(|_| Status::IncorrectDataParameter)?,
                new_pin: Pin::try_from(new).map_err(|_| {
                    warn!("Malformed new PIN");
                    Status::IncorrectDataParameter
                })?,
            },
        })
    }
}

/// PUT DATA payload: `5C LL <tag> 53 LL <value>`, or the discovery object `7E LL <value>`
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PutData<'data> {
    pub container: Container,
    pub value: &'data [u8],
}

impl<'data> TryFrom<&'data [u8]> for PutData<'data> {
    type Error = Status;
    fn try_from(data: &'data [u8]) -> Result<Self, Self::Error> {
        use crate::tlv::take_do;
        let (tag, inner, rem) = take_do(data).ok_or_else(|| {
            warn!("Failed to parse PUT DATA: {:02x?}", data);
            Status::IncorrectDataParameter
        })?;

        let container = match tag {
            0x7E => {
                if !rem.is_empty() {
                    warn!("Empty remainder expected, got: {:02x?}", rem);
                }
                return Ok(PutData {
                    container: Container::DiscoveryObject,
                    value: inner,
                });
            }
            0x5C => Container::try_from(inner).map_err(|_| {
                warn!("PUT DATA for unknown object: {:02x?}", inner);
                Status::NotFound
            })?,
            _ => {
                warn!("Unexpected PUT DATA tag: {:04x}", tag);
                return Err(Status::IncorrectDataParameter);
            }
        };

        let (tag, value, rem) = take_do(rem).ok_or_else(|| {
            warn!(
                "Failed to parse PUT DATA's second field: {:02x?}, {:02x?}",
                data, rem
            );
            Status::IncorrectDataParameter
        })?;

        if tag != 0x53 {
            warn!("Expected 0x53 tag, got: 0x{:04x}", tag);
            return Err(Status::IncorrectDataParameter);
        }

        if !rem.is_empty() {
            warn!("Empty second remainder expected, got: {:02x?}", rem);
        }

        Ok(PutData { container, value })
    }
}

impl<'l, const C: usize> TryFrom<&'l iso7816::Command<C>> for Command<'l> {
    type Error = Status;
    /// The first layer of unraveling the iso7816::Command onion.
    ///
    /// Chained commands must be assembled by the caller, see [`Session`](crate::dispatch::Session).
    fn try_from(command: &'l iso7816::Command<C>) -> Result<Self, Self::Error> {
        if check_class(command)? {
            warn!("Command chaining without a session");
            return Err(Status::CommandChainingNotSupported);
        }
        Self::parse(
            command.instruction(),
            command.p1,
            command.p2,
            command.data().as_slice(),
        )
    }
}
