// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2026.

//! Serial peripheral interface (SPI) driver for the inter-processor link.
//!
//! Runs the controller in the link's fixed configuration: 16-bit frames,
//! MSB first, CPOL low, CPHA first edge, software chip select, fPCLK/8,
//! and the hardware CRC engine with the reset-default polynomial. The
//! driver is interrupt-per-word; the link's frames are at most 257 words
//! at 1.3 Mbaud, so there is no need for DMA.
//!
//! Transfers implement [`upstream_link::hil::spi::SpiLink`]: full duplex
//! through a single window of the packet buffer, with the CRC word clocked
//! after the final data word and checked in hardware.

use core::cell::Cell;

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::registers::{ReadOnly, ReadWrite};
use tock_registers::{register_bitfields, register_structs};

use upstream_link::hil::spi::{SpiLink, SpiLinkClient};
use upstream_link::packet::{Packet, PACKET_BUF_LEN};
use upstream_link::utilities::cells::{OptionalCell, TakeCell};
use upstream_link::ErrorCode;

use crate::static_ref::StaticRef;

register_structs! {
    pub SpiRegisters {
        /// Control register 1
        (0x00 => cr1: ReadWrite<u32, CR1::Register>),
        /// Control register 2
        (0x04 => cr2: ReadWrite<u32, CR2::Register>),
        /// Status register
        (0x08 => sr: ReadWrite<u32, SR::Register>),
        /// Data register
        (0x0C => dr: ReadWrite<u32>),
        /// CRC polynomial register
        (0x10 => crcpr: ReadWrite<u32>),
        /// RX CRC register
        (0x14 => rxcrcr: ReadOnly<u32>),
        /// TX CRC register
        (0x18 => txcrcr: ReadOnly<u32>),
        // I2S configuration and prescaler, unused in SPI mode.
        (0x1C => _reserved0),
        (0x24 => @END),
    }
}

register_bitfields![u32,
    CR1 [
        CPHA OFFSET(0) NUMBITS(1) [],
        CPOL OFFSET(1) NUMBITS(1) [],
        MSTR OFFSET(2) NUMBITS(1) [],
        BR OFFSET(3) NUMBITS(3) [
            FpclkDiv2 = 0b000,
            FpclkDiv4 = 0b001,
            FpclkDiv8 = 0b010,
            FpclkDiv16 = 0b011
        ],
        SPE OFFSET(6) NUMBITS(1) [],
        LSBFIRST OFFSET(7) NUMBITS(1) [],
        SSI OFFSET(8) NUMBITS(1) [],
        SSM OFFSET(9) NUMBITS(1) [],
        RXONLY OFFSET(10) NUMBITS(1) [],
        DFF OFFSET(11) NUMBITS(1) [
            EightBit = 0,
            SixteenBit = 1
        ],
        CRCNEXT OFFSET(12) NUMBITS(1) [],
        CRCEN OFFSET(13) NUMBITS(1) [],
        BIDIOE OFFSET(14) NUMBITS(1) [],
        BIDIMODE OFFSET(15) NUMBITS(1) []
    ],
    CR2 [
        RXDMAEN OFFSET(0) NUMBITS(1) [],
        TXDMAEN OFFSET(1) NUMBITS(1) [],
        SSOE OFFSET(2) NUMBITS(1) [],
        FRF OFFSET(4) NUMBITS(1) [],
        ERRIE OFFSET(5) NUMBITS(1) [],
        RXNEIE OFFSET(6) NUMBITS(1) [],
        TXEIE OFFSET(7) NUMBITS(1) []
    ],
    SR [
        RXNE OFFSET(0) NUMBITS(1) [],
        TXE OFFSET(1) NUMBITS(1) [],
        CHSIDE OFFSET(2) NUMBITS(1) [],
        UDR OFFSET(3) NUMBITS(1) [],
        CRCERR OFFSET(4) NUMBITS(1) [],
        MODF OFFSET(5) NUMBITS(1) [],
        OVR OFFSET(6) NUMBITS(1) [],
        BSY OFFSET(7) NUMBITS(1) [],
        FRE OFFSET(8) NUMBITS(1) []
    ]
];

pub const SPI1_BASE: StaticRef<SpiRegisters> =
    unsafe { StaticRef::new(0x4001_3000 as *const SpiRegisters) };

pub struct Spi<'a> {
    registers: StaticRef<SpiRegisters>,
    client: OptionalCell<&'a dyn SpiLinkClient>,
    packet: TakeCell<'static, Packet>,
    offset: Cell<usize>,
    len_words: Cell<usize>,
    tx_words: Cell<usize>,
    rx_words: Cell<usize>,
}

impl<'a> Spi<'a> {
    pub const fn new(registers: StaticRef<SpiRegisters>) -> Spi<'a> {
        Spi {
            registers,
            client: OptionalCell::empty(),
            packet: TakeCell::empty(),
            offset: Cell::new(0),
            len_words: Cell::new(0),
            tx_words: Cell::new(0),
            rx_words: Cell::new(0),
        }
    }

    /// Program the link's bus parameters. The peripheral stays disabled
    /// between transfers so the CRC engine can be reset per frame.
    pub fn initialize(&self) {
        let regs = self.registers;
        regs.cr1.write(
            CR1::MSTR::SET
                + CR1::BR::FpclkDiv8
                + CR1::CPOL::CLEAR
                + CR1::CPHA::CLEAR
                + CR1::DFF::SixteenBit
                + CR1::LSBFIRST::CLEAR
                + CR1::SSM::SET
                + CR1::SSI::SET
                + CR1::CRCEN::SET,
        );
        // Reset-default polynomial; downstream uses the same.
        regs.crcpr.set(0x0007);
    }

    /// Service the SPI global interrupt.
    pub fn handle_interrupt(&self) {
        let regs = self.registers;

        if regs.sr.is_set(SR::MODF) || regs.sr.is_set(SR::OVR) || regs.sr.is_set(SR::FRE) {
            // Clear OVR by the read-DR read-SR sequence, then report.
            let _ = regs.dr.get();
            let _ = regs.sr.get();
            self.finish(Err(ErrorCode::FAIL));
            return;
        }

        if !regs.sr.is_set(SR::RXNE) {
            return;
        }
        let word = regs.dr.get() as u16;

        if self.rx_words.get() < self.len_words.get() {
            let index = self.rx_words.get();
            self.packet.map(|packet| {
                let bytes = packet.as_mut_bytes();
                let at = self.offset.get() + 2 * index;
                bytes[at..at + 2].copy_from_slice(&word.to_le_bytes());
            });
            self.rx_words.set(index + 1);
            if self.tx_words.get() < self.len_words.get() {
                self.write_next_word();
            }
        } else {
            // The trailing frame is the peer's CRC word; the comparison
            // already happened in hardware.
            let status = if regs.sr.is_set(SR::CRCERR) {
                regs.sr.modify(SR::CRCERR::CLEAR);
                Err(ErrorCode::FAIL)
            } else {
                Ok(())
            };
            self.finish(status);
        }
    }

    fn write_next_word(&self) {
        let regs = self.registers;
        let index = self.tx_words.get();
        let word = self
            .packet
            .map(|packet| {
                let bytes = packet.as_mut_bytes();
                let at = self.offset.get() + 2 * index;
                u16::from_le_bytes([bytes[at], bytes[at + 1]])
            })
            .unwrap_or(0);
        regs.dr.set(word as u32);
        self.tx_words.set(index + 1);
        if self.tx_words.get() == self.len_words.get() {
            // The CRC word follows the final data word.
            regs.cr1.modify(CR1::CRCNEXT::SET);
        }
    }

    fn finish(&self, status: Result<(), ErrorCode>) {
        let regs = self.registers;
        regs.cr2.modify(CR2::RXNEIE::CLEAR + CR2::ERRIE::CLEAR);
        regs.cr1.modify(CR1::SPE::CLEAR);
        if let Some(packet) = self.packet.take() {
            self.client.map(|client| client.transfer_done(packet, status));
        }
    }
}

impl<'a> SpiLink<'a> for Spi<'a> {
    fn set_client(&self, client: &'a dyn SpiLinkClient) {
        self.client.set(client);
    }

    fn transfer(
        &self,
        packet: &'static mut Packet,
        offset: usize,
        len_words: u16,
    ) -> Result<(), (ErrorCode, &'static mut Packet)> {
        if self.packet.is_some() {
            return Err((ErrorCode::BUSY, packet));
        }
        if len_words == 0 || offset + 2 * len_words as usize > PACKET_BUF_LEN {
            return Err((ErrorCode::SIZE, packet));
        }

        self.packet.replace(packet);
        self.offset.set(offset);
        self.len_words.set(len_words as usize);
        self.tx_words.set(0);
        self.rx_words.set(0);

        // Re-arm the CRC engine: toggling CRCEN while disabled zeroes both
        // accumulators.
        let regs = self.registers;
        regs.cr1.modify(CR1::CRCEN::CLEAR);
        regs.cr1.modify(CR1::CRCEN::SET);

        regs.cr2.modify(CR2::RXNEIE::SET + CR2::ERRIE::SET);
        regs.cr1.modify(CR1::SPE::SET);
        self.write_next_word();
        Ok(())
    }
}
