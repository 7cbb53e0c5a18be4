// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2026.

//! The upstream link state machine.
//!
//! Every packet crosses the bus as a size frame and then a body frame, and
//! each frame may start only after downstream pulses the ready line. The
//! state machine tracks which half of which exchange is outstanding:
//! `*Wait` states mean software is ready and the next ready edge starts the
//! transfer; the others mean a transfer is in flight and the SPI completion
//! finishes it. A ready edge that arrives while nothing is waiting for one
//! is latched in `tx_ready_pending` and consumed by the next state that
//! needs it, so an early downstream never deadlocks the link.
//!
//! Three contexts drive the machine. The SPI completion interrupt only
//! records its event and enters the link region (see
//! [`hil::critical::LinkRegion`]); [`Link::service`], called from the main
//! loop, performs the actual transition and exits the region. The
//! ready-edge handler and the upper-layer entry points share one elevated
//! priority level and run their transitions inline. Any mis-sequenced
//! event drives the link into an absorbing error state rather than
//! desynchronising the frame stream; only a reboot leaves it.

use core::cell::Cell;

use crate::errorcode::ErrorCode;
use crate::hil;
use crate::hil::spi::SpiLinkClient;
use crate::packet::{
    Packet, BODY_FRAME_OFFSET, COMMAND_CLASS_ERROR, COMMAND_CLASS_MASK,
    COMMAND_ERROR_DEVICE_DISCONNECTED, PACKET_LEN_MIN_WORDS, SIZE_FRAME_OFFSET, SIZE_FRAME_WORDS,
};
use crate::pool::{FreePacketClient, PacketPool};
use crate::utilities::cells::{OptionalCell, TakeCell};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Idle,

    /// Transmit submitted; size frame awaits the ready edge.
    TxSizeWait,
    /// Size frame on the wire.
    TxSize,
    /// Body frame awaits the ready edge.
    TxPacketWait,
    /// Body frame on the wire.
    TxPacket,

    /// Receive requested; size frame awaits the ready edge (and a free
    /// packet).
    RxSizeWait,
    /// Dummy size frame on the wire, reply length incoming.
    RxSize,
    /// Reply body awaits the ready edge.
    RxPacketWait,
    /// Reply body on the wire.
    RxPacket,

    /// Absorbing. Entered on any protocol violation, never left.
    Error,
}

/// Receives packets delivered by [`Link::receive_packet`].
pub trait ReceiveClient {
    /// One-shot delivery of the reply. `Some(packet)` hands over the loan;
    /// the client must eventually release it. `None` reports a link fault;
    /// the link is in its error state and stays there.
    ///
    /// The link clears its waiter slot before this call, so the client may
    /// register a new receive from inside the callback.
    fn packet_received(&self, packet: Option<&'static mut Packet>);
}

/// Notified when downstream reports that its device disconnected.
pub trait DisconnectClient {
    fn device_disconnected(&self);
}

/// Board-level handler for internally detected link anomalies.
///
/// Called once per anomaly, after the link has already locked itself into
/// the error state. A production board might toggle a diagnostic GPIO here;
/// a development board might panic.
pub trait FaultHook {
    fn link_fault(&self);
}

pub struct Link<'a, S: hil::spi::SpiLink<'a>> {
    spi: &'a S,
    cs: &'a dyn hil::gpio::Pin,
    ready: &'a dyn hil::gpio::ReadyLine,
    region: &'a dyn hil::critical::LinkRegion,
    pool: &'a PacketPool<'a>,

    state: Cell<State>,
    /// The packet of the outstanding exchange, while no transfer is in
    /// flight. During a transfer the SPI driver holds it; between
    /// completion interrupt and pump it sits in `completed`.
    current: TakeCell<'static, Packet>,
    /// At most one transmit queued behind the in-flight one.
    next_tx: TakeCell<'static, Packet>,
    /// A ready edge arrived while nothing was waiting on one.
    tx_ready_pending: Cell<bool>,

    /// Completion handoff from the SPI interrupt to [`Link::service`].
    spi_completion_pending: Cell<bool>,
    completed: TakeCell<'static, Packet>,
    completed_status: Cell<Result<(), ErrorCode>>,

    /// Header snapshot of the last transmit, for matching the reply. Taken
    /// at transmit start: the in-place size frame may let downstream's
    /// meaningless reply word land on top of the size field.
    sent_command_class: Cell<u8>,
    sent_command: Cell<u8>,
    sent_length_words: Cell<u16>,

    receive_waiter: OptionalCell<&'a dyn ReceiveClient>,
    disconnect_client: OptionalCell<&'a dyn DisconnectClient>,
    fault_hook: OptionalCell<&'a dyn FaultHook>,
    fault_count: Cell<u32>,
}

impl<'a, S: hil::spi::SpiLink<'a>> Link<'a, S> {
    pub fn new(
        spi: &'a S,
        cs: &'a dyn hil::gpio::Pin,
        ready: &'a dyn hil::gpio::ReadyLine,
        region: &'a dyn hil::critical::LinkRegion,
        pool: &'a PacketPool<'a>,
    ) -> Link<'a, S> {
        Link {
            spi,
            cs,
            ready,
            region,
            pool,
            state: Cell::new(State::Idle),
            current: TakeCell::empty(),
            next_tx: TakeCell::empty(),
            tx_ready_pending: Cell::new(false),
            spi_completion_pending: Cell::new(false),
            completed: TakeCell::empty(),
            completed_status: Cell::new(Ok(())),
            sent_command_class: Cell::new(0),
            sent_command: Cell::new(0),
            sent_length_words: Cell::new(0),
            receive_waiter: OptionalCell::empty(),
            disconnect_client: OptionalCell::empty(),
            fault_hook: OptionalCell::empty(),
            fault_count: Cell::new(0),
        }
    }

    /// Park chip select and sample the ready line. Downstream may have
    /// signalled readiness before we booted; latch it so the first request
    /// does not wait for an edge that already happened.
    pub fn initialize(&self) {
        self.cs.set();
        if self.ready.is_asserted() {
            self.tx_ready_pending.set(true);
        }
    }

    pub fn set_disconnect_client(&self, client: &'a dyn DisconnectClient) {
        self.disconnect_client.set(client);
    }

    pub fn set_fault_hook(&self, hook: &'a dyn FaultHook) {
        self.fault_hook.set(hook);
    }

    /// Anomalies detected since boot. Saturates.
    pub fn fault_count(&self) -> u32 {
        self.fault_count.get()
    }

    /// Lock the link into the error state and tell the board.
    fn raise_fault(&self) {
        self.state.set(State::Error);
        self.fault_count.set(self.fault_count.get().saturating_add(1));
        self.fault_hook.map(|hook| hook.link_fault());
    }

    /// [`Link::raise_fault`], plus the null-sentinel delivery an armed
    /// receive waiter is owed on any link fault.
    fn fault(&self) {
        self.raise_fault();
        if let Some(waiter) = self.receive_waiter.take() {
            waiter.packet_received(None);
        }
    }

    /// Consume a latched ready edge, if one is pending.
    fn take_ready(&self) -> bool {
        self.tx_ready_pending.replace(false)
    }

    // === Upper-layer entry points ===
    //
    // These run at the elevated interrupt level (or with it masked), so
    // they are atomic against the ready-edge handler and the pump.

    /// Submit `packet` for transmission.
    ///
    /// Legal from idle, which starts the exchange, or while a transmit is
    /// outstanding, which queues `packet` behind it; the queue is one deep.
    /// Not legal while receiving: the size/body sequence must not be split.
    /// On failure the packet is handed back to the caller.
    pub fn transmit_packet(
        &self,
        packet: &'static mut Packet,
    ) -> Result<(), (ErrorCode, &'static mut Packet)> {
        if self.state.get() == State::Error {
            return Err((ErrorCode::OFF, packet));
        }

        if !self.pool.is_member(packet) {
            self.fault();
            return Err((ErrorCode::INVAL, packet));
        }
        if !packet.length_valid() {
            self.fault();
            return Err((ErrorCode::SIZE, packet));
        }
        if self.next_tx.is_some() {
            self.fault();
            return Err((ErrorCode::BUSY, packet));
        }

        match self.state.get() {
            State::TxSizeWait | State::TxSize | State::TxPacketWait | State::TxPacket => {
                // Already vetted; it is picked up when the in-flight
                // transmit finishes.
                self.next_tx.replace(packet);
                Ok(())
            }
            State::Idle => {
                self.state.set(State::TxSizeWait);
                self.sent_command_class.set(packet.command_class());
                self.sent_command.set(packet.command());
                self.sent_length_words.set(packet.length_words());
                self.current.replace(packet);
                if self.take_ready() {
                    self.begin_transmit_size();
                }
                Ok(())
            }
            _ => {
                self.fault();
                Err((ErrorCode::INVAL, packet))
            }
        }
    }

    /// Register the one-shot consumer for the next received packet.
    ///
    /// Legal from idle or while transmitting; reception starts once the
    /// transmit queue drains. Not legal while a receive is already
    /// outstanding or another waiter is registered.
    pub fn receive_packet(&'a self, client: &'a dyn ReceiveClient) -> Result<(), ErrorCode> {
        if self.state.get() == State::Error {
            return Err(ErrorCode::OFF);
        }
        if self.receive_waiter.is_some() {
            self.fault();
            return Err(ErrorCode::ALREADY);
        }
        self.receive_waiter.set(client);
        self.check_begin_reception()
    }

    /// Hand a free packet to `client`, now or when one is released.
    pub fn get_free_packet(&self, client: &'a dyn FreePacketClient) -> Result<(), ErrorCode> {
        if self.state.get() == State::Error {
            return Err(ErrorCode::OFF);
        }
        match self.pool.acquire_async(client) {
            Ok(()) => Ok(()),
            Err(code) => {
                self.fault();
                Err(code)
            }
        }
    }

    /// Take a free packet that is known to be available right now.
    pub fn get_free_packet_immediate(&self) -> Option<&'static mut Packet> {
        if self.state.get() == State::Error {
            return None;
        }
        let packet = self.pool.try_acquire_now();
        if packet.is_none() {
            // The caller believed a slot was free; the accounting is wrong.
            self.fault();
        }
        packet
    }

    /// Return a loan to the pool.
    pub fn release_packet(
        &self,
        packet: &'static mut Packet,
    ) -> Result<(), (ErrorCode, &'static mut Packet)> {
        if self.state.get() == State::Error {
            return Err((ErrorCode::OFF, packet));
        }
        match self.pool.release(packet) {
            Ok(()) => Ok(()),
            Err((code, packet)) => {
                self.fault();
                Err((code, packet))
            }
        }
    }

    // === Ready-edge entry point ===

    /// Call from the downstream-ready falling-edge interrupt.
    ///
    /// In idle the edge is latched; in a `*Wait` state it starts the
    /// transfer that was waiting on it. During an active transfer the edge
    /// is a protocol violation: downstream signals readiness for the *next*
    /// frame only after the current one completed on its side, and the
    /// completion interrupt outranks this handler.
    pub fn ready_edge(&'a self) {
        match self.state.get() {
            State::Error => {}
            State::Idle => self.tx_ready_pending.set(true),
            State::TxSizeWait => self.begin_transmit_size(),
            State::TxPacketWait => self.begin_transmit_body(),
            State::RxSizeWait => self.request_receive_buffer(),
            State::RxPacketWait => self.begin_receive_body(),
            _ => self.fault(),
        }
    }

    // === Main-loop pump ===

    /// Drain a pending SPI completion. Call from the main loop.
    ///
    /// The completion interrupt entered the link region before returning,
    /// so the transition below runs with the ready-edge and upper-layer
    /// interrupts masked; they are delivered when the region is exited.
    pub fn service(&'a self) {
        if !self.spi_completion_pending.replace(false) {
            return;
        }
        self.process_completion();
        self.region.exit();
    }

    fn process_completion(&'a self) {
        self.cs.set();

        let status = self.completed_status.get();
        let Some(packet) = self.completed.take() else {
            self.fault();
            return;
        };

        if self.state.get() == State::Error {
            let _ = self.pool.release(packet);
            return;
        }

        if status.is_err() {
            // The peripheral reported a transfer fault, CRC mismatch
            // included. Unrecoverable: the frame stream is no longer
            // trustworthy.
            let waiter = self.receive_waiter.take();
            self.raise_fault();
            let _ = self.pool.release(packet);
            if let Some(waiter) = waiter {
                waiter.packet_received(None);
            }
            return;
        }

        match self.state.get() {
            State::TxSize => {
                self.current.replace(packet);
                self.state.set(State::TxPacketWait);
                if self.take_ready() {
                    self.begin_transmit_body();
                }
            }
            State::TxPacket => self.end_of_transmit(packet),
            State::RxSize => {
                if !packet.length_valid() {
                    // Downstream announced a body we cannot hold (or an
                    // undersized one); resynchronising is impossible.
                    let waiter = self.receive_waiter.take();
                    self.raise_fault();
                    let _ = self.pool.release(packet);
                    if let Some(waiter) = waiter {
                        waiter.packet_received(None);
                    }
                    return;
                }
                self.current.replace(packet);
                self.state.set(State::RxPacketWait);
                if self.take_ready() {
                    self.begin_receive_body();
                }
            }
            State::RxPacket => self.end_of_receive(packet),
            _ => self.fault(),
        }
    }

    /// The transmit body finished: promote a queued transmit or go idle,
    /// then release the finished packet. The release happens last so a
    /// woken pool waiter observes a consistent link.
    fn end_of_transmit(&'a self, packet: &'static mut Packet) {
        // A parked pool waiter here only adds up when the other packet is
        // queued behind us; otherwise the accounting has drifted.
        if self.pool.has_waiter() && self.next_tx.is_none() {
            let waiter = self.receive_waiter.take();
            self.raise_fault();
            let _ = self.pool.release(packet);
            if let Some(waiter) = waiter {
                waiter.packet_received(None);
            }
            return;
        }

        if let Some(next) = self.next_tx.take() {
            self.state.set(State::TxSizeWait);
            self.sent_command_class.set(next.command_class());
            self.sent_command.set(next.command());
            self.sent_length_words.set(next.length_words());
            self.current.replace(next);
            if self.take_ready() {
                self.begin_transmit_size();
            }
        } else {
            self.state.set(State::Idle);
            if self.receive_waiter.is_some() {
                let _ = self.check_begin_reception();
            }
        }

        if self.pool.release(packet).is_err() {
            self.fault();
        }
    }

    /// The reply body finished: hand the packet to whoever asked for it.
    fn end_of_receive(&self, packet: &'static mut Packet) {
        self.state.set(State::Idle);

        if self.receive_waiter.is_none() {
            self.raise_fault();
            let _ = self.pool.release(packet);
            return;
        }

        if packet.command_class() == COMMAND_CLASS_ERROR
            && packet.command() == COMMAND_ERROR_DEVICE_DISCONNECTED
        {
            // Downstream lost its device. A protocol-level signal for the
            // device state machine, not a link fault; the waiter keeps
            // waiting for nothing and is cleared without delivery.
            let _ = self.pool.release(packet);
            self.receive_waiter.clear();
            self.disconnect_client.map(|client| client.device_disconnected());
            return;
        }

        if (packet.command_class() & COMMAND_CLASS_MASK)
            != (self.sent_command_class.get() & COMMAND_CLASS_MASK)
            || packet.command() != self.sent_command.get()
        {
            // The reply does not answer what we asked: request and reply
            // streams have desynchronised.
            let waiter = self.receive_waiter.take();
            self.raise_fault();
            let _ = self.pool.release(packet);
            if let Some(waiter) = waiter {
                waiter.packet_received(None);
            }
            return;
        }

        // Clear the waiter before delivering so the client may register a
        // new receive inside its callback. The client owns the loan now
        // and must release it.
        if let Some(waiter) = self.receive_waiter.take() {
            waiter.packet_received(Some(packet));
        }
    }

    /// Move toward reception if the link is in a position to.
    fn check_begin_reception(&'a self) -> Result<(), ErrorCode> {
        match self.state.get() {
            State::Error => Err(ErrorCode::OFF),
            State::RxSizeWait | State::RxSize | State::RxPacketWait | State::RxPacket => {
                self.fault();
                Err(ErrorCode::INVAL)
            }
            State::Idle => {
                self.state.set(State::RxSizeWait);
                if self.take_ready() {
                    self.request_receive_buffer();
                }
                Ok(())
            }
            // A transmit is outstanding; reception begins when it drains.
            _ => Ok(()),
        }
    }

    /// Downstream is ready for the receive-size frame; all we need is a
    /// buffer. The pool may hand one over synchronously, or later from a
    /// releasing holder.
    fn request_receive_buffer(&'a self) {
        if self.pool.acquire_async(self).is_err() {
            self.fault();
        }
    }

    // === Transfer sequencer ===
    //
    // Each frame is a full-duplex in-place transfer over a window of the
    // current packet: an outgoing byte is shifted out before its
    // replacement lands, and the controller needs an RX destination even
    // when the peer's data is meaningless.

    fn begin_transmit_size(&self) {
        self.state.set(State::TxSize);
        match self.current.take() {
            Some(packet) => {
                self.cs.clear();
                if let Err((_, packet)) =
                    self.spi.transfer(packet, SIZE_FRAME_OFFSET, SIZE_FRAME_WORDS)
                {
                    self.current.replace(packet);
                    self.fault();
                }
            }
            None => self.fault(),
        }
    }

    fn begin_transmit_body(&self) {
        self.state.set(State::TxPacket);
        match self.current.take() {
            Some(packet) => {
                let len_words = self.sent_length_words.get().max(PACKET_LEN_MIN_WORDS);
                self.cs.clear();
                if let Err((_, packet)) = self.spi.transfer(packet, BODY_FRAME_OFFSET, len_words) {
                    self.current.replace(packet);
                    self.fault();
                }
            }
            None => self.fault(),
        }
    }

    fn begin_receive_size(&self, packet: &'static mut Packet) {
        if self.state.get() == State::Error {
            let _ = self.pool.release(packet);
            return;
        }
        if self.state.get() != State::RxSizeWait {
            let _ = self.pool.release(packet);
            self.fault();
            return;
        }
        self.state.set(State::RxSize);
        // The window we receive into is also what we transmit from; zero
        // means "dummy packet, I am here to read your reply".
        packet.set_length_words(0);
        self.cs.clear();
        if let Err((_, packet)) = self.spi.transfer(packet, SIZE_FRAME_OFFSET, SIZE_FRAME_WORDS) {
            self.current.replace(packet);
            self.fault();
        }
    }

    fn begin_receive_body(&self) {
        self.state.set(State::RxPacket);
        match self.current.take() {
            Some(packet) => {
                // Validated at size-frame completion; downstream clocks at
                // least the two header bytes.
                let len_words = packet.body_len_words();
                self.cs.clear();
                if let Err((_, packet)) = self.spi.transfer(packet, BODY_FRAME_OFFSET, len_words) {
                    self.current.replace(packet);
                    self.fault();
                }
            }
            None => self.fault(),
        }
    }
}

/// Completion router: the SPI interrupt records its event and masks the
/// other link interrupt sources; [`Link::service`] does the real work.
impl<'a, S: hil::spi::SpiLink<'a>> SpiLinkClient for Link<'a, S> {
    fn transfer_done(&self, packet: &'static mut Packet, status: Result<(), ErrorCode>) {
        self.region.enter();
        self.completed.replace(packet);
        self.completed_status.set(status);
        self.spi_completion_pending.set(true);
    }
}

/// The pool's handoff for the receive path: a buffer became free while the
/// link was waiting to start the receive-size frame.
impl<'a, S: hil::spi::SpiLink<'a>> FreePacketClient for Link<'a, S> {
    fn packet_available(&self, packet: &'static mut Packet) {
        self.begin_receive_size(packet);
    }
}
