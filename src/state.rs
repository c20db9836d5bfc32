// Copyright (C) 2022 Nicolas Stalder AND  Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

use core::convert::TryFrom;

use heapless_bytes::Bytes;
use iso7816::Status;
use subtle::ConstantTimeEq;

use crate::constants::*;
use crate::container::{
    AsymmetricKeyReference, Container, ReadAccessRule, SecurityCondition, OBJECT_COUNT,
};
use crate::crypto::{AdministrationKey, AsymmetricKey, MAX_CHALLENGE_LENGTH};
use crate::piv_types::{Algorithms, Pin};

crate::container::enum_subset! {
    #[derive(Debug)]
    pub enum AdministrationAlgorithm: Algorithms {
        Tdes,
        Aes256
    }
}

impl AdministrationAlgorithm {
    pub fn challenge_length(self) -> usize {
        match self {
            Self::Tdes => 8,
            Self::Aes256 => 16,
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            Self::Tdes => 24,
            Self::Aes256 => 32,
        }
    }
}

/// Key slots. A slot is empty until GENERATE ASYMMETRIC KEY PAIR fills it.
pub struct Keys {
    // 9b "PIV Card Application Administration Key"
    pub administration: AdministrationKey,
    // 9a, 9c, 9d, 9e in that order
    asymmetric: [Option<AsymmetricKey>; 4],
}

impl Keys {
    pub fn new(administration: AdministrationKey) -> Self {
        Self {
            administration,
            asymmetric: Default::default(),
        }
    }

    pub fn asymmetric_for_reference(&self, key: AsymmetricKeyReference) -> Option<&AsymmetricKey> {
        self.asymmetric[key.index()].as_ref()
    }

    /// Store a new key, returning the one it replaces
    pub fn set_asymmetric_for_reference(
        &mut self,
        key: AsymmetricKeyReference,
        new: AsymmetricKey,
    ) -> Option<AsymmetricKey> {
        self.asymmetric[key.index()].replace(new)
    }
}

/// Values of the data objects
#[derive(Default)]
pub struct ObjectStore {
    values: heapless::LinearMap<Container, heapless::Vec<u8, MAX_OBJECT_SIZE>, OBJECT_COUNT>,
}

impl ObjectStore {
    /// The stored value, or the fixed one for read-only objects
    pub fn get(&self, container: Container) -> Option<&[u8]> {
        match container.entry().static_value {
            Some(value) => Some(value),
            None => self.values.get(&container).map(|value| value.as_slice()),
        }
    }

    /// Replace the value of `container`.
    ///
    /// The previous value is left untouched if the new one is rejected.
    pub fn put(&mut self, container: Container, value: &[u8]) -> Result<(), Status> {
        if container.is_static() {
            warn!("Attempt to overwrite read-only object {:?}", container);
            return Err(Status::ConditionsOfUseNotSatisfied);
        }
        let value = heapless::Vec::from_slice(value).map_err(|_| {
            warn!(
                "Object too large for {:?}: {} > {}",
                container,
                value.len(),
                MAX_OBJECT_SIZE
            );
            Status::WrongLength
        })?;
        self.values.insert(container, value).map_err(|_| {
            error!("No slot left for {:?}", container);
            Status::NotEnoughMemory
        })?;
        Ok(())
    }
}

/// State surviving a card reset
pub struct Persistent {
    pub keys: Keys,
    pub objects: ObjectStore,
    // padded with 0xFF to 8 bytes
    pin: [u8; 8],
    pin_max_retries: u8,
    consecutive_pin_mismatches: u8,
}

impl Persistent {
    pub fn new(options: &crate::Options) -> Self {
        info!("initializing PIV state");
        if Pin::try_from(&options.initial_pin()[..]).is_err() {
            warn!("Configured PIN is not a valid PIN, VERIFY will never succeed");
        }
        Self {
            keys: Keys::new(options.administration_key()),
            objects: ObjectStore::default(),
            pin: options.initial_pin(),
            pin_max_retries: options.max_pin_retries(),
            consecutive_pin_mismatches: 0,
        }
    }

    pub fn remaining_pin_retries(&self) -> u8 {
        self.pin_max_retries
            .saturating_sub(self.consecutive_pin_mismatches)
    }

    pub fn pin_blocked(&self) -> bool {
        self.remaining_pin_retries() == 0
    }

    /// Compare `value` to the PIN and update the retry counter.
    ///
    /// Always fails once the PIN is blocked.
    pub fn verify_pin(&mut self, value: &Pin) -> bool {
        if self.pin_blocked() {
            return false;
        }
        if bool::from(value.padded()[..].ct_eq(&self.pin[..])) {
            self.consecutive_pin_mismatches = 0;
            true
        } else {
            self.consecutive_pin_mismatches += 1;
            false
        }
    }

    pub fn change_pin(&mut self, old_value: &Pin, new_value: &Pin) -> bool {
        if !self.verify_pin(old_value) {
            return false;
        }
        self.pin = *new_value.padded();
        true
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Volatile {
    pub app_security_status: AppSecurityStatus,
    pub command_cache: Option<CommandCache>,
}

impl Volatile {
    pub fn security_valid(&self, condition: SecurityCondition) -> bool {
        use SecurityCondition::*;
        match condition {
            Pin => self.app_security_status.pin_verified,
            Always => true,
        }
    }

    pub fn read_valid(&self, condition: ReadAccessRule) -> bool {
        use ReadAccessRule::*;
        match condition {
            Pin => self.app_security_status.pin_verified,
            Always => true,
        }
    }

    pub fn take_witness(&mut self) -> Option<Bytes<MAX_CHALLENGE_LENGTH>> {
        match self.command_cache.take() {
            Some(CommandCache::WitnessChallenge(b)) => return Some(b),
            old => self.command_cache = old,
        };
        None
    }

    pub fn take_challenge(&mut self) -> Option<Bytes<MAX_CHALLENGE_LENGTH>> {
        match self.command_cache.take() {
            Some(CommandCache::AuthenticateChallenge(b)) => return Some(b),
            old => self.command_cache = old,
        };
        None
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AppSecurityStatus {
    pub pin_verified: bool,
    pub administrator_verified: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandCache {
    /// Plain witness, sent encrypted in '80'
    WitnessChallenge(Bytes<MAX_CHALLENGE_LENGTH>),
    /// Expected cryptogram for the challenge sent in '81'
    AuthenticateChallenge(Bytes<MAX_CHALLENGE_LENGTH>),
}

pub struct State {
    pub volatile: Volatile,
    pub persistent: Persistent,
}

impl State {
    pub fn new(options: &crate::Options) -> Self {
        Self {
            volatile: Default::default(),
            persistent: Persistent::new(options),
        }
    }
}
