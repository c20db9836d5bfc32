// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Command chaining and response segmentation (ISO 7816-4, 5.1.1 and 7.1.3).
//!
//! [`Session`] holds the transaction state between APDUs, [`Card`] bundles it with an
//! [`Authenticator`] for transports that deal in raw APDUs.

use iso7816::{Data, Status};
use rand_core::{CryptoRng, RngCore};

use crate::commands::check_class;
use crate::constants::*;
use crate::{Authenticator, Options};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct ChainHeader {
    instruction: u8,
    p1: u8,
    p2: u8,
}

/// Transient state of one card session
pub struct Session {
    chain: Option<ChainHeader>,
    command: Data<COMMAND_SIZE>,
    response: Data<RESPONSE_SIZE>,
    offset: usize,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            chain: None,
            command: Data::new(),
            response: Data::new(),
            offset: 0,
        }
    }

    /// Drop any partial chain and pending response
    pub fn reset(&mut self) {
        self.discard_chain();
        self.discard_response();
    }

    pub fn chain_in_progress(&self) -> bool {
        self.chain.is_some()
    }

    /// Number of response bytes still waiting for GET RESPONSE
    pub fn pending_response(&self) -> usize {
        self.response.len() - self.offset
    }

    fn discard_chain(&mut self) {
        self.chain = None;
        self.command.clear();
    }

    fn discard_response(&mut self) {
        self.response.clear();
        self.offset = 0;
    }

    /// Process one APDU.
    ///
    /// `reply` receives the data of the response APDU, the returned status is its status word.
    pub fn handle<T, const C: usize, const R: usize>(
        &mut self,
        authenticator: &mut Authenticator<T>,
        command: &iso7816::Command<C>,
        reply: &mut Data<R>,
    ) -> Status
    where
        T: RngCore + CryptoRng,
    {
        reply.clear();
        let chained = match check_class(command) {
            Ok(chained) => chained,
            Err(status) => return status,
        };
        let header = ChainHeader {
            instruction: u8::from(command.instruction()),
            p1: command.p1,
            p2: command.p2,
        };

        if header.instruction == GET_RESPONSE_INS && !chained && self.chain.is_none() {
            return self.get_response(header, command.expected(), reply);
        }
        if header.instruction == SELECT_INS && !chained && self.chain.is_some() {
            info!("SELECT abandons pending chain");
            self.discard_chain();
        }
        self.discard_response();

        if let Err(status) = self.receive(header, chained, command.data()) {
            return status;
        }
        if chained {
            return Status::Success;
        }

        let result = authenticator.execute_raw(
            command.instruction(),
            header.p1,
            header.p2,
            &self.command,
            &mut self.response,
        );
        self.discard_chain();
        match result {
            Ok(()) => self.next_chunk(command.expected(), reply),
            Err(status) => {
                self.discard_response();
                status
            }
        }
    }

    /// Append the data of one APDU to the command buffer
    fn receive(&mut self, header: ChainHeader, chained: bool, data: &[u8]) -> Result<(), Status> {
        match self.chain {
            Some(previous) if previous != header => {
                warn!(
                    "Chain interrupted: expected {:02x?}, got {:02x?}",
                    previous, header
                );
                self.discard_chain();
                return Err(Status::ConditionsOfUseNotSatisfied);
            }
            Some(_) => {}
            None => self.command.clear(),
        }

        if self.command.extend_from_slice(data).is_err() {
            warn!(
                "Command too large: {} > {}",
                self.command.len() + data.len(),
                COMMAND_SIZE
            );
            self.discard_chain();
            return Err(Status::WrongLength);
        }

        if chained {
            debug!("Chained {} bytes", self.command.len());
            self.chain = Some(header);
        } else {
            self.chain = None;
        }
        Ok(())
    }

    fn get_response<const R: usize>(
        &mut self,
        header: ChainHeader,
        expected: usize,
        reply: &mut Data<R>,
    ) -> Status {
        if (header.p1, header.p2) != (0x00, 0x00) {
            return Status::IncorrectP1OrP2Parameter;
        }
        if self.pending_response() == 0 {
            warn!("GET RESPONSE without pending data");
            return Status::ConditionsOfUseNotSatisfied;
        }
        self.next_chunk(expected, reply)
    }

    /// Move the next chunk of the buffered response to `reply`
    fn next_chunk<const R: usize>(&mut self, expected: usize, reply: &mut Data<R>) -> Status {
        let mut chunk = if expected == 0 { MAX_CHUNK } else { expected };
        chunk = chunk.min(MAX_CHUNK).min(R);

        let end = (self.offset + chunk).min(self.response.len());
        if reply
            .extend_from_slice(&self.response[self.offset..end])
            .is_err()
        {
            error!("Reply buffer full");
            self.discard_response();
            return Status::UnspecifiedNonpersistentExecutionError;
        }
        self.offset = end;

        match self.pending_response() {
            0 => {
                self.discard_response();
                Status::Success
            }
            remaining => {
                debug!("{} bytes remaining", remaining);
                Status::MoreAvailable(u8::try_from(remaining).unwrap_or(0))
            }
        }
    }
}

/// An [`Authenticator`] together with its [`Session`].
pub struct Card<T> {
    authenticator: Authenticator<T>,
    session: Session,
}

impl<T: RngCore + CryptoRng> Card<T> {
    pub fn new(options: Options, rng: T) -> Self {
        Self {
            authenticator: Authenticator::new(options, rng),
            session: Session::new(),
        }
    }

    pub fn authenticator(&self) -> &Authenticator<T> {
        &self.authenticator
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Respond to one APDU, see [`Session::handle`].
    pub fn respond<const C: usize, const R: usize>(
        &mut self,
        command: &iso7816::Command<C>,
        reply: &mut Data<R>,
    ) -> Status {
        self.session.handle(&mut self.authenticator, command, reply)
    }

    /// Respond to a raw command APDU with a raw response APDU (data followed by the status word).
    pub fn handle_apdu(&mut self, apdu: &[u8]) -> heapless::Vec<u8, { MAX_CHUNK + 2 }> {
        let mut reply = Data::<MAX_CHUNK>::new();
        let status = match iso7816::Command::<COMMAND_SIZE>::try_from(apdu) {
            Ok(command) => self.respond(&command, &mut reply),
            Err(err) => {
                warn!("Failed to parse APDU {:02x?}: {:?}", apdu, err);
                match err {
                    iso7816::command::FromSliceError::InvalidClass => Status::ClassNotSupported,
                    _ => Status::WrongLength,
                }
            }
        };
        let mut response = heapless::Vec::new();
        response.extend_from_slice(&reply).ok();
        let sw: [u8; 2] = status.into();
        response.extend_from_slice(&sw).ok();
        response
    }

    /// Card reset: clear the session and the security status.
    pub fn reset(&mut self) {
        info!("Card reset");
        self.session.reset();
        self.authenticator.deselect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use rand_core::OsRng;
    use test_log::test;

    fn card() -> Card<OsRng> {
        Card::new(Options::new(), OsRng)
    }

    fn authenticate(card: &mut Card<OsRng>) {
        assert!(card
            .handle_apdu(&hex!("00 A4 04 00 05 A000000308"))
            .ends_with(&hex!("9000")));
        card.authenticator.state.volatile.app_security_status.administrator_verified = true;
    }

    #[test]
    fn chaining() {
        let mut card = card();
        authenticate(&mut card);

        let mut value = [0u8; 300];
        value.iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);
        let mut data = hex!("5C 03 5FC105 53 82 012C").to_vec();
        data.extend_from_slice(&value);

        let (first, rest) = data.split_at(200);
        let mut apdu = hex!("10 DB 3F FF C8").to_vec();
        apdu.extend_from_slice(first);
        assert_eq!(card.handle_apdu(&apdu), hex!("9000"));
        assert!(card.session().chain_in_progress());

        let mut apdu = hex!("00 DB 3F FF").to_vec();
        apdu.push(rest.len() as u8);
        apdu.extend_from_slice(rest);
        assert_eq!(card.handle_apdu(&apdu), hex!("9000"));
        assert!(!card.session().chain_in_progress());

        // 4 byte header and 300 bytes of value, segmented
        let response = card.handle_apdu(&hex!("00 CB 3F FF 05 5C 03 5FC105"));
        assert_eq!(response.len(), 257);
        assert_eq!(&response[..4], &hex!("53 82 012C"));
        assert_eq!(&response[255..], &hex!("61 31"));
        assert_eq!(card.session().pending_response(), 0x31);

        let response = card.handle_apdu(&hex!("00 C0 00 00 00"));
        assert_eq!(response.len(), 0x31 + 2);
        assert_eq!(&response[0x31..], &hex!("9000"));
        assert_eq!(&response[..0x31], &value[300 - 0x31..]);
        assert_eq!(card.session().pending_response(), 0);
    }

    #[test]
    fn chain_mismatch() {
        let mut card = card();
        authenticate(&mut card);
        assert_eq!(card.handle_apdu(&hex!("10 DB 3F FF 02 5C03")), hex!("9000"));
        assert_eq!(
            card.handle_apdu(&hex!("00 CB 3F FF 05 5C 03 5FC105")),
            hex!("6985")
        );
        assert!(!card.session().chain_in_progress());
    }

    #[test]
    fn select_abandons_chain() {
        let mut card = card();
        authenticate(&mut card);
        assert_eq!(card.handle_apdu(&hex!("10 DB 3F FF 02 5C03")), hex!("9000"));
        assert!(card.session().chain_in_progress());

        let response = card.handle_apdu(&hex!("00 A4 04 00 05 A000000308"));
        assert_eq!(response[0], 0x61);
        assert_eq!(&response[response.len() - 2..], &hex!("9000"));
        assert!(!card.session().chain_in_progress());

        // The next command starts from scratch
        authenticate(&mut card);
        assert_eq!(
            card.handle_apdu(&hex!("00 DB 3F FF 0A 5C 03 5FC105 53 03 70 01 AA")),
            hex!("9000")
        );
        assert_eq!(
            card.handle_apdu(&hex!("00 CB 3F FF 05 5C 03 5FC105")),
            hex!("53 03 70 01 AA 9000")
        );
    }

    #[test]
    fn chain_overflow() {
        let mut card = card();
        authenticate(&mut card);
        let mut apdu = hex!("10 DB 3F FF FF").to_vec();
        apdu.extend_from_slice(&[0xAA; 0xFF]);
        for _ in 0..(COMMAND_SIZE / 0xFF) {
            assert_eq!(card.handle_apdu(&apdu), hex!("9000"));
        }
        assert_eq!(card.handle_apdu(&apdu), hex!("6700"));
        assert!(!card.session().chain_in_progress());
    }

    #[test]
    fn get_response() {
        let mut card = card();
        assert_eq!(card.handle_apdu(&hex!("00 C0 00 00 00")), hex!("6985"));

        authenticate(&mut card);
        let mut data = hex!("5C 03 5FC105 53 82 0200").to_vec();
        data.extend_from_slice(&[0x42; 0x200]);
        let mut apdu = hex!("00 DB 3F FF 00").to_vec();
        apdu.extend_from_slice(&(data.len() as u16).to_be_bytes());
        apdu.extend_from_slice(&data);
        assert_eq!(card.handle_apdu(&apdu), hex!("9000"));

        let response = card.handle_apdu(&hex!("00 CB 3F FF 05 5C 03 5FC105"));
        assert_eq!(&response[255..], &hex!("61 00"));
        // Le limits the chunk
        let response = card.handle_apdu(&hex!("00 C0 00 00 10"));
        assert_eq!(response.len(), 0x12);
        assert_eq!(&response[0x10..], &hex!("61 F5"));
        assert_eq!(
            card.handle_apdu(&hex!("00 C0 01 00 00")),
            hex!("6A86")
        );
        // Any other command drops the pending response
        assert_eq!(card.handle_apdu(&hex!("00 20 00 80 00")), hex!("63C5"));
        assert_eq!(card.handle_apdu(&hex!("00 C0 00 00 00")), hex!("6985"));
    }

    #[test]
    fn class_errors() {
        let mut card = card();
        assert_eq!(
            card.handle_apdu(&hex!("0C A4 04 00 05 A000000308")),
            hex!("6882")
        );
        assert_eq!(
            card.handle_apdu(&hex!("01 A4 04 00 05 A000000308")),
            hex!("6881")
        );
        assert_eq!(card.handle_apdu(&hex!("00 A4")), hex!("6700"));
    }
}
