// Copyright (C) 2022 Nicolas Stalder AND  Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[cfg(not(feature = "delog"))]
#[macro_use]
extern crate log;

#[cfg(feature = "delog")]
delog::generate_macros!();

pub mod commands;
pub use commands::Command;
use commands::{ChangeReference, GeneralAuthenticate, PutData, Verify};
pub mod constants;
pub mod container;
use container::{
    AsymmetricKeyReference, AuthenticateKeyReference, Container, GenerateKeyReference,
    KeyReference,
};
pub mod crypto;
use crypto::{AdministrationKey, AsymmetricKey};
pub mod derp;
pub mod dispatch;
pub use dispatch::{Card, Session};
pub mod piv_types;
mod reply;
pub mod state;
mod tlv;

pub use piv_types::{Algorithms, AsymmetricAlgorithms, Pin};

use core::convert::TryFrom;

use flexiber::EncodableHeapless;
use iso7816::{Data, Instruction, Status};
use rand_core::{CryptoRng, RngCore};
use subtle::ConstantTimeEq;

use constants::*;

pub type Result = iso7816::Result<()>;
use reply::Reply;
pub use state::AdministrationAlgorithm;
use state::{AppSecurityStatus, CommandCache, Keys, State};

cfg_if::cfg_if! {
    if #[cfg(feature = "rsa")] {
        const SUPPORTED_ALGORITHMS: &[Algorithms] = &[
            Algorithms::Tdes,
            Algorithms::Aes256,
            Algorithms::Rsa2048,
            Algorithms::P256,
        ];
    } else {
        const SUPPORTED_ALGORITHMS: &[Algorithms] = &[
            Algorithms::Tdes,
            Algorithms::Aes256,
            Algorithms::P256,
        ];
    }
}

/// Personalization of the application.
#[derive(Clone, Copy)]
pub struct Options {
    pin: [u8; 8],
    pin_retries: u8,
    administration_key: AdministrationKey,
    label: &'static [u8],
}

impl core::fmt::Debug for Options {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Options")
            .field("pin_retries", &self.pin_retries)
            .field("administration_algorithm", &self.administration_key.alg())
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

impl Options {
    /// PIN `12345678` with 5 retries and the 3DES management key `0102030405060708` (three times)
    pub const fn new() -> Self {
        Self {
            pin: DEFAULT_PIN,
            pin_retries: DEFAULT_PIN_RETRIES,
            administration_key: AdministrationKey::new(
                AdministrationAlgorithm::Tdes,
                DEFAULT_MANAGEMENT_KEY,
            ),
            label: APPLICATION_LABEL,
        }
    }

    /// Initial PIN, padded with `FF` to 8 bytes
    pub const fn pin(mut self, padded: [u8; 8]) -> Self {
        self.pin = padded;
        self
    }

    /// Number of consecutive wrong PINs before the PIN is blocked, between 1 and 15
    pub const fn pin_retries(mut self, retries: u8) -> Self {
        self.pin_retries = if retries == 0 {
            1
        } else if retries > MAX_PIN_RETRIES {
            MAX_PIN_RETRIES
        } else {
            retries
        };
        self
    }

    /// Card management key (9B). The key length must match the algorithm.
    pub const fn management_key(mut self, alg: AdministrationAlgorithm, key: &'static [u8]) -> Self {
        self.administration_key = AdministrationKey::new(alg, key);
        self
    }

    /// Application label returned on SELECT
    pub const fn label(mut self, label: &'static [u8]) -> Self {
        self.label = label;
        self
    }

    pub fn initial_pin(&self) -> [u8; 8] {
        self.pin
    }

    pub fn max_pin_retries(&self) -> u8 {
        self.pin_retries
    }

    pub fn administration_key(&self) -> AdministrationKey {
        self.administration_key
    }

    pub fn application_label(&self) -> &'static [u8] {
        self.label
    }
}

/// PIV application.
///
/// `T` is the source of randomness for challenges and key generation.
pub struct Authenticator<T> {
    options: Options,
    state: State,
    rng: T,
}

impl<T> iso7816::App for Authenticator<T> {
    fn aid(&self) -> iso7816::Aid {
        iso7816::Aid::new_truncatable(&PIV_AID, RID_LENGTH)
    }
}

impl<T> Authenticator<T>
where
    T: RngCore + CryptoRng,
{
    pub fn new(options: Options, rng: T) -> Self {
        if options.administration_key.is_valid() {
            info!("PIV application with {:?}", options);
        } else {
            warn!("Management key length does not match {:?}", options);
        }
        Self {
            state: State::new(&options),
            options,
            rng,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn security_status(&self) -> &AppSecurityStatus {
        &self.state.volatile.app_security_status
    }

    pub fn remaining_pin_retries(&self) -> u8 {
        self.state.persistent.remaining_pin_retries()
    }

    /// Clear the security status, as on card reset or selection of another application
    pub fn deselect(&mut self) {
        self.state.volatile = Default::default();
    }

    pub fn select<const R: usize>(&mut self, mut reply: Reply<'_, R>) -> Result {
        info!("selecting PIV");
        self.deselect();

        let application_property_template = piv_types::ApplicationPropertyTemplate::default()
            .with_application_label(self.options.label)
            .with_application_url(APPLICATION_URL)
            .with_supported_cryptographic_algorithms(SUPPORTED_ALGORITHMS);

        application_property_template
            .encode_to_heapless_vec(*reply)
            .map_err(|_| {
                error!("Failed to encode application property template");
                Status::NotEnoughMemory
            })?;
        debug!("returning: {:02X?}", reply);
        Ok(())
    }

    /// Respond to a complete command.
    ///
    /// Chained commands and responses longer than 255 bytes need a [`Session`], see
    /// [`respond_with_session`](Self::respond_with_session).
    pub fn respond<const C: usize, const R: usize>(
        &mut self,
        command: &iso7816::Command<C>,
        reply: &mut Data<R>,
    ) -> Result {
        let parsed_command = Command::try_from(command)?;
        self.execute(parsed_command, command.data(), reply)
    }

    /// Respond to one APDU of a session, see [`Session::handle`].
    pub fn respond_with_session<const C: usize, const R: usize>(
        &mut self,
        session: &mut Session,
        command: &iso7816::Command<C>,
        reply: &mut Data<R>,
    ) -> Status {
        session.handle(self, command, reply)
    }

    /// Parse and execute a command whose data has been assembled from a chain
    pub(crate) fn execute_raw<const R: usize>(
        &mut self,
        instruction: Instruction,
        p1: u8,
        p2: u8,
        data: &[u8],
        reply: &mut Data<R>,
    ) -> Result {
        let parsed_command = Command::parse(instruction, p1, p2, data)?;
        self.execute(parsed_command, data, reply)
    }

    fn execute<const R: usize>(
        &mut self,
        command: Command<'_>,
        data: &[u8],
        reply: &mut Data<R>,
    ) -> Result {
        info!("parsed: {:?}", &command);
        let reply = Reply(reply);

        match command {
            Command::Select(_aid) => self.select(reply),
            Command::Verify(verify) => self.verify(verify),
            Command::ChangeReference(change_reference) => self.change_reference(change_reference),
            Command::GetData(container) => self.get_data(container, reply),
            Command::PutData => self.put_data(data),
            Command::GeneralAuthenticate(authenticate) => {
                self.general_authenticate(authenticate, data, reply)
            }
            Command::GenerateAsymmetric(reference) => {
                self.generate_asymmetric_keypair(reference, data, reply)
            }
        }
    }

    /// Status after a wrong PIN
    fn pin_mismatch(&mut self) -> Result {
        self.state.volatile.app_security_status.pin_verified = false;
        match self.state.persistent.remaining_pin_retries() {
            0 => {
                warn!("PIN blocked");
                Err(Status::OperationBlocked)
            }
            remaining => {
                warn!("Wrong PIN, {} retries left", remaining);
                Err(Status::RemainingRetries(remaining))
            }
        }
    }

    pub fn login(&mut self, pin: Pin) -> Result {
        if self.state.persistent.pin_blocked() {
            warn!("VERIFY with blocked PIN");
            self.state.volatile.app_security_status.pin_verified = false;
            return Err(Status::OperationBlocked);
        }

        if self.state.persistent.verify_pin(&pin) {
            info!("PIN verified");
            self.state.volatile.app_security_status.pin_verified = true;
            Ok(())
        } else {
            self.pin_mismatch()
        }
    }

    pub fn verify(&mut self, command: Verify) -> Result {
        match command {
            Verify::Login(pin) => self.login(pin),

            Verify::Logout(_) => {
                info!("Logout");
                self.state.volatile.app_security_status.pin_verified = false;
                Ok(())
            }

            Verify::Status(_) => {
                if self.state.volatile.app_security_status.pin_verified {
                    Ok(())
                } else if self.state.persistent.pin_blocked() {
                    Err(Status::OperationBlocked)
                } else {
                    let retries = self.state.persistent.remaining_pin_retries();
                    Err(Status::RemainingRetries(retries))
                }
            }
        }
    }

    pub fn change_reference(&mut self, command: ChangeReference) -> Result {
        match command {
            ChangeReference::ChangePin { old_pin, new_pin } => self.change_pin(old_pin, new_pin),
        }
    }

    pub fn change_pin(&mut self, old_pin: Pin, new_pin: Pin) -> Result {
        if self.state.persistent.pin_blocked() {
            warn!("CHANGE REFERENCE DATA with blocked PIN");
            self.state.volatile.app_security_status.pin_verified = false;
            return Err(Status::OperationBlocked);
        }

        if !self.state.persistent.change_pin(&old_pin, &new_pin) {
            return self.pin_mismatch();
        }

        info!("PIN changed");
        self.state.volatile.app_security_status.pin_verified = true;
        Ok(())
    }

    // SP 800-73-4, Part 2, Section 3.2.4
    // https://nvlpubs.nist.gov/nistpubs/SpecialPublications/NIST.SP.800-73-4.pdf#page=92
    //
    // General use:
    // - Card management key (9B):
    //   - card to client witness (MUTUAL with '81')
    //   - client to card challenge (EXTERNAL)
    // - PIV authn keys (9A, 9E) and signature key (9C): sign a digest computed off card
    // - Key management key (9D): RSA key transport ('81') or ECDH ('85')
    //
    // Data field tags:
    // - 80 witness
    // - 81 challenge
    // - 82 response
    // - 85 exponentiation
    //
    // Request for requests:
    // - '80 00' returns '80 TL <encrypted random>'
    // - '81 00' returns '81 TL <random>'
    //
    // Errors:
    // - 9000, 61XX for success
    // - 6982 security status
    // - 6A80, 6A86 for data, P1/P2 issue
    pub fn general_authenticate<const R: usize>(
        &mut self,
        auth: GeneralAuthenticate,
        data: &[u8],
        mut reply: Reply<'_, R>,
    ) -> Result {
        // ECDSA signature with the PIV authentication key:
        //
        // 00 87 11 9A 26
        //     # 7c = dynamic authentication template
        //     7C 24
        //         # 82 = response, 00 = "request for request"
        //         82 00
        //         # 81 = challenge
        //         81 20
        //             # 32B digest
        //             95 AE 21 F9 5E 00 01 E6 23 27 F4 FD A5 05 F1 F5 B7 95 0F 11 75 BC 4D A2 06 B1 00 6B DA 90 C3 3A
        //
        // expected response: "7C L1 82 L2 SEQ(INT r, INT s)"

        if !self
            .state
            .volatile
            .security_valid(KeyReference::from(auth.key_reference).use_security_condition())
        {
            warn!(
                "Security condition not satisfied for key {:?}",
                auth.key_reference
            );
            return Err(Status::SecurityStatusNotSatisfied);
        }

        if auth.key_reference == KeyReference::PivCardApplicationAdministration {
            let alg = self.state.persistent.keys.administration.alg();
            if alg != auth.algorithm {
                warn!(
                    "Bad algorithm: {:?}, management key is {:?}",
                    auth.algorithm, alg
                );
                return Err(Status::IncorrectP1OrP2Parameter);
            }
        }

        reply.expand(&[0x7C])?;
        let offset = reply.len();
        // Set once a witness is validated in this template, allowing mutual authentication
        let mut witness_validated = false;
        let input = derp::Input::from(data);
        input.read_all(Status::IncorrectDataParameter, |input| {
            derp::nested(
                input,
                Status::IncorrectDataParameter,
                Status::IncorrectDataParameter,
                0x7C,
                |input| {
                    while !input.at_end() {
                        let (tag, data) = match derp::read_tag_and_get_value(input) {
                            Ok((tag, data)) => (tag, data),
                            Err(_err) => {
                                warn!("Failed to parse data: {:?}", _err);
                                return Err(Status::IncorrectDataParameter);
                            }
                        };

                        // part 2 table 7
                        match tag {
                            0x80 => witness_validated |= self.witness(auth, data, reply.lend())?,
                            0x81 => {
                                self.challenge(auth, data, witness_validated, reply.lend())?
                            }
                            0x82 => self.response(auth, data, reply.lend())?,
                            0x85 => self.exponentiation(auth, data, reply.lend())?,
                            _ => {
                                warn!("Unsupported tag in authentication template: {:02x}", tag);
                                return Err(Status::IncorrectDataParameter);
                            }
                        }
                    }
                    Ok(())
                },
            )
        })?;
        reply.prepend_len(offset)
    }

    /// Tag '80'. Returns whether a witness was validated.
    pub fn witness<const R: usize>(
        &mut self,
        auth: GeneralAuthenticate,
        data: derp::Input<'_>,
        reply: Reply<'_, R>,
    ) -> core::result::Result<bool, Status> {
        if auth.key_reference != KeyReference::PivCardApplicationAdministration {
            warn!("Witness for key {:?}", auth.key_reference);
            return Err(Status::FunctionNotSupported);
        }
        if data.is_empty() {
            self.request_for_witness(reply)?;
            Ok(false)
        } else {
            self.admin_witness_validate(data)?;
            Ok(true)
        }
    }

    pub fn request_for_witness<const R: usize>(&mut self, mut reply: Reply<'_, R>) -> Result {
        info!("Request for witness");

        let admin = self.state.persistent.keys.administration;
        let witness = crypto::random_challenge(&mut self.rng, admin.alg().challenge_length())?;
        let encrypted = admin.encrypt(&witness)?;
        self.state.volatile.command_cache = Some(CommandCache::WitnessChallenge(witness));

        reply.append_do(&[0x80], &encrypted)
    }

    pub fn admin_witness_validate(&mut self, data: derp::Input<'_>) -> Result {
        let Some(original) = self.state.volatile.take_witness() else {
            warn!("Witness without a pending request");
            return Err(Status::ConditionsOfUseNotSatisfied);
        };
        if data.as_slice_less_safe().ct_eq(&original[..]).into() {
            info!("Correct witness validation");
            self.state
                .volatile
                .app_security_status
                .administrator_verified = true;
            Ok(())
        } else {
            warn!("Incorrect witness validation");
            self.state
                .volatile
                .app_security_status
                .administrator_verified = false;
            Err(Status::SecurityStatusNotSatisfied)
        }
    }

    /// Tag '81'
    pub fn challenge<const R: usize>(
        &mut self,
        auth: GeneralAuthenticate,
        data: derp::Input<'_>,
        witness_validated: bool,
        reply: Reply<'_, R>,
    ) -> Result {
        use AuthenticateKeyReference::*;
        match auth.key_reference {
            PivCardApplicationAdministration if data.is_empty() => {
                self.request_for_challenge(reply)
            }
            PivCardApplicationAdministration => {
                self.admin_challenge_respond(data, witness_validated, reply)
            }
            PivAuthentication | DigitalSignature | CardAuthentication => {
                self.sign_challenge(auth, data, reply)
            }
            KeyManagement => self.agreement_challenge(auth, data, reply),
        }
    }

    pub fn request_for_challenge<const R: usize>(&mut self, mut reply: Reply<'_, R>) -> Result {
        info!("Request for challenge");

        let admin = self.state.persistent.keys.administration;
        let challenge = crypto::random_challenge(&mut self.rng, admin.alg().challenge_length())?;
        let expected = admin.encrypt(&challenge)?;
        self.state.volatile.command_cache = Some(CommandCache::AuthenticateChallenge(expected));

        reply.append_do(&[0x81], &challenge)
    }

    /// Encrypt the client's challenge, completing mutual authentication
    pub fn admin_challenge_respond<const R: usize>(
        &mut self,
        data: derp::Input<'_>,
        witness_validated: bool,
        mut reply: Reply<'_, R>,
    ) -> Result {
        if !witness_validated {
            warn!("Challenge for the management key without a witness");
            return Err(Status::ConditionsOfUseNotSatisfied);
        }

        let admin = self.state.persistent.keys.administration;
        if data.len() != admin.alg().challenge_length() {
            warn!(
                "Bad challenge length. Got {}, expected {} for algorithm: {:?}",
                data.len(),
                admin.alg().challenge_length(),
                admin.alg()
            );
            return Err(Status::IncorrectDataParameter);
        }

        let response = admin.encrypt(data.as_slice_less_safe())?;
        reply.append_do(&[0x82], &response)
    }

    /// Tag '82'
    pub fn response<const R: usize>(
        &mut self,
        auth: GeneralAuthenticate,
        data: derp::Input<'_>,
        _reply: Reply<'_, R>,
    ) -> Result {
        if data.is_empty() {
            info!("Request for response");
            return Ok(());
        }
        if auth.key_reference != KeyReference::PivCardApplicationAdministration {
            warn!("Response with bad key ref: {:?}", auth);
            return Err(Status::IncorrectP1OrP2Parameter);
        }

        let Some(expected) = self.state.volatile.take_challenge() else {
            warn!("Response without a challenge");
            return Err(Status::ConditionsOfUseNotSatisfied);
        };
        if data.as_slice_less_safe().ct_eq(&expected[..]).into() {
            info!("Correct challenge validation");
            self.state
                .volatile
                .app_security_status
                .administrator_verified = true;
            Ok(())
        } else {
            warn!("Incorrect challenge validation");
            self.state
                .volatile
                .app_security_status
                .administrator_verified = false;
            Err(Status::SecurityStatusNotSatisfied)
        }
    }

    pub fn sign_challenge<const R: usize>(
        &mut self,
        auth: GeneralAuthenticate,
        data: derp::Input<'_>,
        reply: Reply<'_, R>,
    ) -> Result {
        info!("Signature with {:?}", auth.key_reference);
        asymmetric_key(&self.state.persistent.keys, auth)?.sign(
            data.as_slice_less_safe(),
            &mut self.rng,
            reply,
        )
    }

    pub fn agreement_challenge<const R: usize>(
        &mut self,
        auth: GeneralAuthenticate,
        data: derp::Input<'_>,
        reply: Reply<'_, R>,
    ) -> Result {
        info!("Key transport with {:?}", auth.key_reference);
        asymmetric_key(&self.state.persistent.keys, auth)?.decrypt(
            data.as_slice_less_safe(),
            &mut self.rng,
            reply,
        )
    }

    /// Tag '85'
    pub fn exponentiation<const R: usize>(
        &mut self,
        auth: GeneralAuthenticate,
        data: derp::Input<'_>,
        reply: Reply<'_, R>,
    ) -> Result {
        info!("Request for exponentiation");
        asymmetric_key(&self.state.persistent.keys, auth)?
            .agree(data.as_slice_less_safe(), reply)
    }

    pub fn generate_asymmetric_keypair<const R: usize>(
        &mut self,
        reference: GenerateKeyReference,
        data: &[u8],
        mut reply: Reply<'_, R>,
    ) -> Result {
        if !self
            .state
            .volatile
            .app_security_status
            .administrator_verified
        {
            warn!("Unauthorized attempt to generate a key for {:?}", reference);
            return Err(Status::SecurityStatusNotSatisfied);
        }

        // example: 00 47 00 9A 05
        //   AC 03
        //      # P256
        //      80 01 11
        let input = derp::Input::from(data);
        let mechanism_data = input.read_all(Status::IncorrectDataParameter, |input| {
            derp::nested(
                input,
                Status::IncorrectDataParameter,
                Status::IncorrectDataParameter,
                0xAC,
                |input| {
                    derp::expect_tag_and_get_value(input, 0x80)
                        .map(|input| input.as_slice_less_safe())
                        .map_err(|_e| {
                            warn!("error parsing GenerateAsymmetricKeypair: {:?}", &_e);
                            Status::IncorrectDataParameter
                        })
                },
            )
        })?;

        let [mechanism] = mechanism_data else {
            warn!("Mechanism of len not 1: {mechanism_data:02x?}");
            return Err(Status::IncorrectDataParameter);
        };

        let algorithm = Algorithms::try_from(*mechanism).map_err(|_| {
            warn!("Unknown mechanism: {mechanism:x}");
            Status::IncorrectDataParameter
        })?;
        let parsed_mechanism = AsymmetricAlgorithms::supported(algorithm)?;

        let key = AsymmetricKey::generate(parsed_mechanism, &mut self.rng)?;
        key.write_public_key(reply.lend())?;
        info!("Generated {:?} for {:?}", parsed_mechanism, reference);
        self.state
            .persistent
            .keys
            .set_asymmetric_for_reference(reference, key);
        Ok(())
    }

    fn get_data<const R: usize>(
        &mut self,
        container: Container,
        mut reply: Reply<'_, R>,
    ) -> Result {
        if !self
            .state
            .volatile
            .read_valid(container.contact_access_rule())
        {
            warn!("Unauthorized attempt to access: {:?}", container);
            return Err(Status::SecurityStatusNotSatisfied);
        }

        let Some(value) = self.state.persistent.objects.get(container) else {
            warn!("Object not set: {:?}", container);
            return Err(Status::NotFound);
        };
        if container.is_static() {
            // Carries its own template
            reply.expand(value)
        } else {
            reply.append_do(&[0x53], value)
        }
    }

    fn put_data(&mut self, data: &[u8]) -> Result {
        if !self
            .state
            .volatile
            .app_security_status
            .administrator_verified
        {
            warn!("Unauthorized attempt at PUT DATA");
            return Err(Status::SecurityStatusNotSatisfied);
        }

        let PutData { container, value } = PutData::try_from(data)?;
        info!("PUT DATA {:?}, {} bytes", container, value.len());
        self.state.persistent.objects.put(container, value)
    }
}

/// The generated key GENERAL AUTHENTICATE operates on.
///
/// A mismatch between the algorithm in P1 and the key is only logged, the key decides.
fn asymmetric_key(
    keys: &Keys,
    auth: GeneralAuthenticate,
) -> core::result::Result<&AsymmetricKey, Status> {
    let key_reference = AsymmetricKeyReference::try_from(auth.key_reference).map_err(|_| {
        warn!(
            "Attempt to use non asymmetric key: {:?}",
            auth.key_reference
        );
        Status::IncorrectP1OrP2Parameter
    })?;
    let Some(key) = keys.asymmetric_for_reference(key_reference) else {
        warn!("Attempt to use unset key {:?}", key_reference);
        return Err(Status::ConditionsOfUseNotSatisfied);
    };
    if key.algorithm() != auth.algorithm {
        warn!(
            "Algorithm mismatch: requested {:?}, key is {:?}",
            auth.algorithm,
            key.algorithm()
        );
    }
    Ok(key)
}
