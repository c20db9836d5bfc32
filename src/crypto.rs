// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Key material of the application and the primitives operating on it.

use des::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use heapless_bytes::Bytes;
use iso7816::Status;
use p256::ecdsa::{signature::hazmat::PrehashSigner, Signature, SigningKey};
use rand_core::{CryptoRng, RngCore};

#[cfg(feature = "rsa")]
use rsa::{
    hazmat::rsa_decrypt_and_check,
    traits::PublicKeyParts,
    BigUint, Pkcs1v15Sign, RsaPrivateKey,
};

use crate::piv_types::AsymmetricAlgorithms;
use crate::reply::Reply;
use crate::state::AdministrationAlgorithm;

/// Largest challenge of the supported administration algorithms (AES block size)
pub const MAX_CHALLENGE_LENGTH: usize = 16;

#[cfg(feature = "rsa")]
const RSA_2048_BYTES: usize = 256;
/// A P-256 ECDSA prehash must cover at least half the field size
const MIN_PREHASH_LENGTH: usize = 16;
const MAX_PREHASH_LENGTH: usize = 32;

/// PIV Card Application Administration Key (9B)
#[derive(Clone, Copy)]
pub struct AdministrationKey {
    alg: AdministrationAlgorithm,
    key: &'static [u8],
}

impl AdministrationKey {
    pub const fn new(alg: AdministrationAlgorithm, key: &'static [u8]) -> Self {
        Self { alg, key }
    }

    pub fn alg(&self) -> AdministrationAlgorithm {
        self.alg
    }

    /// Whether the key length matches the algorithm
    pub fn is_valid(&self) -> bool {
        self.key.len() == self.alg.key_len()
    }

    /// Encrypt one block (ECB) with the administration key
    pub fn encrypt(&self, block: &[u8]) -> Result<Bytes<MAX_CHALLENGE_LENGTH>, Status> {
        if !self.is_valid() {
            error!(
                "Bad administration key length: {}, expected {} for {:?}",
                self.key.len(),
                self.alg.key_len(),
                self.alg
            );
            return Err(Status::UnspecifiedCheckingError);
        }
        match self.alg {
            AdministrationAlgorithm::Tdes => encrypt_ecb::<des::TdesEde3>(self.key, block),
            AdministrationAlgorithm::Aes256 => encrypt_ecb::<aes::Aes256>(self.key, block),
        }
    }
}

fn encrypt_ecb<C: BlockEncrypt + KeyInit>(
    key: &[u8],
    block: &[u8],
) -> Result<Bytes<MAX_CHALLENGE_LENGTH>, Status> {
    if block.len() != C::block_size() {
        warn!(
            "Bad block length: {}, expected {}",
            block.len(),
            C::block_size()
        );
        return Err(Status::IncorrectDataParameter);
    }
    let cipher = C::new_from_slice(key).map_err(|_| {
        error!("Administration key of invalid length");
        Status::UnspecifiedCheckingError
    })?;
    let mut buffer = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut buffer);
    Bytes::from_slice(&buffer).map_err(|_| Status::UnspecifiedCheckingError)
}

/// Draw a fresh challenge of `len` bytes
pub fn random_challenge<R: RngCore + CryptoRng>(
    rng: &mut R,
    len: usize,
) -> Result<Bytes<MAX_CHALLENGE_LENGTH>, Status> {
    let mut challenge = [0; MAX_CHALLENGE_LENGTH];
    let challenge = challenge.get_mut(..len).ok_or_else(|| {
        error!("Challenge too large: {len}");
        Status::UnspecifiedCheckingError
    })?;
    rng.try_fill_bytes(challenge).map_err(|_err| {
        error!("Failed to get random bytes: {:?}", _err);
        Status::UnspecifiedCheckingError
    })?;
    Bytes::from_slice(challenge).map_err(|_| Status::UnspecifiedCheckingError)
}

/// Private key held in one of the asymmetric key slots (9A, 9C, 9D, 9E)
pub enum AsymmetricKey {
    #[cfg(feature = "rsa")]
    Rsa2048(RsaPrivateKey),
    P256(SigningKey),
}

impl core::fmt::Debug for AsymmetricKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Never print key material
        f.debug_tuple("AsymmetricKey")
            .field(&self.algorithm())
            .finish()
    }
}

impl AsymmetricKey {
    pub fn generate<R: RngCore + CryptoRng>(
        alg: AsymmetricAlgorithms,
        rng: &mut R,
    ) -> Result<Self, Status> {
        info!("Generating {:?} key", alg);
        Ok(match alg {
            #[cfg(feature = "rsa")]
            AsymmetricAlgorithms::Rsa2048 => {
                let key = RsaPrivateKey::new(rng, RSA_2048_BYTES * 8).map_err(|_err| {
                    error!("Failed to generate RSA key: {:?}", _err);
                    Status::UnspecifiedCheckingError
                })?;
                Self::Rsa2048(key)
            }
            AsymmetricAlgorithms::P256 => Self::P256(SigningKey::random(rng)),
        })
    }

    pub fn algorithm(&self) -> AsymmetricAlgorithms {
        match self {
            #[cfg(feature = "rsa")]
            Self::Rsa2048(_) => AsymmetricAlgorithms::Rsa2048,
            Self::P256(_) => AsymmetricAlgorithms::P256,
        }
    }

    /// Write the public key data object ('7F49', SP 800-73-4 Part 2, Table 9)
    pub fn write_public_key<const R: usize>(&self, mut reply: Reply<'_, R>) -> Result<(), Status> {
        reply.expand(&[0x7F, 0x49])?;
        let offset = reply.len();
        match self {
            #[cfg(feature = "rsa")]
            Self::Rsa2048(key) => {
                reply.append_do(&[0x81], &left_pad::<RSA_2048_BYTES>(&key.n().to_bytes_be())?)?;
                reply.append_do(&[0x82], &key.e().to_bytes_be())?;
            }
            Self::P256(key) => {
                let point = key.verifying_key().to_encoded_point(false);
                reply.append_do(&[0x86], point.as_bytes())?;
            }
        }
        reply.prepend_len(offset)
    }

    /// Sign `data` and write `82 LL <signature>`
    ///
    /// RSA expects a complete PKCS#1 v1.5 type 1 block, ECDSA the bare digest.
    pub fn sign<const R: usize, Rng: RngCore + CryptoRng>(
        &self,
        data: &[u8],
        rng: &mut Rng,
        mut reply: Reply<'_, R>,
    ) -> Result<(), Status> {
        match self {
            #[cfg(feature = "rsa")]
            Self::Rsa2048(key) => {
                if data.len() != RSA_2048_BYTES {
                    warn!("Bad RSA block length: {}", data.len());
                    return Err(Status::IncorrectDataParameter);
                }
                let digest = strip_pkcs1v15_padding(data)?;
                let signature = key
                    .sign_with_rng(rng, Pkcs1v15Sign::new_unprefixed(), digest)
                    .map_err(|_err| {
                        warn!("Failed to sign: {:?}", _err);
                        Status::IncorrectDataParameter
                    })?;
                reply.append_do(&[0x82], &signature)
            }
            Self::P256(key) => {
                if !(MIN_PREHASH_LENGTH..=MAX_PREHASH_LENGTH).contains(&data.len()) {
                    warn!("Bad digest length: {}", data.len());
                    return Err(Status::IncorrectDataParameter);
                }
                let signature: Signature = key.sign_prehash(data).map_err(|_err| {
                    warn!("Failed to sign: {:?}", _err);
                    Status::IncorrectDataParameter
                })?;
                reply.append_do(&[0x82], signature.to_der().as_bytes())
            }
        }
    }

    /// Raw RSA private key operation, used for key transport on the key management key
    ///
    /// The exponentiation is blinded with `rng` and checked against the public key.
    #[cfg_attr(not(feature = "rsa"), allow(unused_variables, unused_mut))]
    pub fn decrypt<const R: usize, Rng: RngCore + CryptoRng>(
        &self,
        data: &[u8],
        rng: &mut Rng,
        mut reply: Reply<'_, R>,
    ) -> Result<(), Status> {
        match self {
            #[cfg(feature = "rsa")]
            Self::Rsa2048(key) => {
                if data.len() != RSA_2048_BYTES {
                    warn!("Bad RSA block length: {}", data.len());
                    return Err(Status::IncorrectDataParameter);
                }
                let c = BigUint::from_bytes_be(data);
                if &c >= key.n() {
                    warn!("RSA input larger than modulus");
                    return Err(Status::IncorrectDataParameter);
                }
                let m = rsa_decrypt_and_check(key, Some(rng), &c).map_err(|_err| {
                    warn!("Failed to decrypt: {:?}", _err);
                    Status::IncorrectDataParameter
                })?;
                reply.append_do(&[0x82], &left_pad::<RSA_2048_BYTES>(&m.to_bytes_be())?)
            }
            #[allow(unreachable_patterns)]
            _ => {
                warn!("Attempt to decrypt with {:?} key", self.algorithm());
                Err(Status::ConditionsOfUseNotSatisfied)
            }
        }
    }

    /// ECDH with an uncompressed point `04 X Y`, writing `82 LL <shared X>`
    pub fn agree<const R: usize>(&self, point: &[u8], mut reply: Reply<'_, R>) -> Result<(), Status> {
        match self {
            Self::P256(key) => {
                if point.first() != Some(&0x04) {
                    warn!("Bad data format for ECDH");
                    return Err(Status::IncorrectDataParameter);
                }
                let public_key = p256::PublicKey::from_sec1_bytes(point).map_err(|_| {
                    warn!("Failed to load public key");
                    Status::IncorrectDataParameter
                })?;
                let shared_secret =
                    p256::ecdh::diffie_hellman(key.as_nonzero_scalar(), public_key.as_affine());
                reply.append_do(&[0x82], shared_secret.raw_secret_bytes())
            }
            #[allow(unreachable_patterns)]
            _ => {
                warn!("Attempt to exponentiate with {:?} key", self.algorithm());
                Err(Status::ConditionsOfUseNotSatisfied)
            }
        }
    }
}

/// Remove `00 01 FF…FF 00` and return the payload
#[cfg(feature = "rsa")]
fn strip_pkcs1v15_padding(data: &[u8]) -> Result<&[u8], Status> {
    if data.len() < 3 {
        warn!("Attempt to sign too little data");
        return Err(Status::IncorrectDataParameter);
    }
    if data[0] != 0 || data[1] != 1 {
        warn!("Attempt to sign with bad padding");
        return Err(Status::IncorrectDataParameter);
    }
    let mut data = &data[2..];
    loop {
        let Some(b) = data.first() else {
            warn!("Sign is only padding");
            return Err(Status::IncorrectDataParameter);
        };
        data = &data[1..];
        if *b == 0xFF {
            continue;
        }
        if *b == 0 {
            break;
        }
        warn!("Invalid padding value");
        return Err(Status::IncorrectDataParameter);
    }
    Ok(data)
}

#[cfg(feature = "rsa")]
fn left_pad<const N: usize>(data: &[u8]) -> Result<[u8; N], Status> {
    let mut padded = [0; N];
    let start = N.checked_sub(data.len()).ok_or_else(|| {
        error!("Big integer larger than {N} bytes");
        Status::UnspecifiedCheckingError
    })?;
    padded[start..].copy_from_slice(data);
    Ok(padded)
}
