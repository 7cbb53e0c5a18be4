// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2026.

//! Interface for the full-duplex SPI transfer primitive under the link.
//!
//! The bus runs in controller mode with 16-bit frames, MSB first, CPOL low,
//! CPHA first edge, and the peripheral's CRC engine enabled. Chip select is
//! software-driven by the link itself (see [`crate::hil::gpio::Pin`]); the
//! driver only shifts words.
//!
//! Transfers operate on a window of a [`Packet`] rather than a pair of
//! buffers: the controller requires an RX destination even when the peer's
//! data is meaningless, and an outgoing byte is always shifted out before
//! its replacement lands, so transmit and receive share one mutable region.
//! This is the same buffer-typed split-phase shape as `hil::flash` in the
//! kernel, with `Packet` standing in for the page type.

use crate::errorcode::ErrorCode;
use crate::packet::Packet;

/// Full-duplex word transfers over the inter-processor SPI bus.
pub trait SpiLink<'a> {
    /// Set the client to receive transfer completions.
    fn set_client(&self, client: &'a dyn SpiLinkClient);

    /// Begin a full-duplex transfer of `len_words` 16-bit frames through
    /// `packet`'s buffer starting at byte `offset`. Outgoing bytes are
    /// shifted from the window and incoming bytes land in the same window.
    ///
    /// The transfer is split-phase: `Ok(())` means the driver owns `packet`
    /// until it calls [`SpiLinkClient::transfer_done`]. On error the packet
    /// is handed straight back.
    fn transfer(
        &self,
        packet: &'static mut Packet,
        offset: usize,
        len_words: u16,
    ) -> Result<(), (ErrorCode, &'static mut Packet)>;
}

/// Client of an [`SpiLink`] transfer.
pub trait SpiLinkClient {
    /// Called from the SPI interrupt when a transfer finishes or dies.
    ///
    /// `status` is `Err(ErrorCode::FAIL)` when the peripheral reported an
    /// error, a CRC mismatch included; the frame contents are then
    /// untrustworthy. Implementations run in interrupt context and must
    /// defer real work.
    fn transfer_done(&self, packet: &'static mut Packet, status: Result<(), ErrorCode>);
}
