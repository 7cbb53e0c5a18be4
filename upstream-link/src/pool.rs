// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2026.

//! The two-slot packet pool.
//!
//! Exactly two [`Packet`]s exist, statically allocated by the board and
//! handed to the pool at construction. A loan is a `&'static mut Packet`
//! moved out of its slot, so at most one holder of each packet exists at
//! any time and the pool's accounting cannot drift: a slot is either full
//! (the packet is free) or empty (somebody holds the loan).
//!
//! One waiter may be parked on the pool. When both packets are out and a
//! holder releases one, ownership moves directly from the releaser to the
//! waiter; the slot never refills in between.

use crate::errorcode::ErrorCode;
use crate::packet::Packet;
use crate::utilities::cells::{OptionalCell, TakeCell};

/// Receives a packet from [`PacketPool::acquire_async`] once one is free.
pub trait FreePacketClient {
    /// The pool (or a releasing holder) hands over the loan. May call
    /// [`PacketPool::acquire_async`] again from inside the callback.
    fn packet_available(&self, packet: &'static mut Packet);
}

pub struct PacketPool<'a> {
    slots: [TakeCell<'static, Packet>; 2],
    slot_addrs: [usize; 2],
    pending_free_waiter: OptionalCell<&'a dyn FreePacketClient>,
}

impl<'a> PacketPool<'a> {
    pub fn new(packet0: &'static mut Packet, packet1: &'static mut Packet) -> PacketPool<'a> {
        let addr0 = core::ptr::from_ref::<Packet>(packet0) as usize;
        let addr1 = core::ptr::from_ref::<Packet>(packet1) as usize;
        PacketPool {
            slots: [TakeCell::new(packet0), TakeCell::new(packet1)],
            slot_addrs: [addr0, addr1],
            pending_free_waiter: OptionalCell::empty(),
        }
    }

    /// Take the first free packet, or `None` if both are out. Never parks a
    /// waiter; for contexts that believe a slot is available right now.
    pub fn try_acquire_now(&self) -> Option<&'static mut Packet> {
        for slot in self.slots.iter() {
            if let Some(packet) = slot.take() {
                return Some(packet);
            }
        }
        None
    }

    /// Hand a free packet to `client`, synchronously if one is free now,
    /// otherwise as soon as a holder releases one.
    ///
    /// Only one waiter fits: a second `acquire_async` while one is parked is
    /// a protocol violation and returns `ALREADY` without disturbing the
    /// parked waiter.
    pub fn acquire_async(&self, client: &'a dyn FreePacketClient) -> Result<(), ErrorCode> {
        if self.pending_free_waiter.is_some() {
            return Err(ErrorCode::ALREADY);
        }
        match self.try_acquire_now() {
            Some(packet) => {
                client.packet_available(packet);
                Ok(())
            }
            None => {
                self.pending_free_waiter.set(client);
                Ok(())
            }
        }
    }

    /// Return a loan. If a waiter is parked the packet moves straight to it
    /// and the slot stays empty; otherwise the slot refills.
    ///
    /// The waiter is cleared *before* it is invoked: a waiter may turn
    /// around and call [`PacketPool::acquire_async`] from inside its
    /// callback, and that re-registration must find the slot empty.
    pub fn release(
        &self,
        packet: &'static mut Packet,
    ) -> Result<(), (ErrorCode, &'static mut Packet)> {
        let addr = core::ptr::from_ref::<Packet>(packet) as usize;
        let Some(index) = self.slot_addrs.iter().position(|&slot| slot == addr) else {
            return Err((ErrorCode::INVAL, packet));
        };
        match self.pending_free_waiter.take() {
            Some(waiter) => waiter.packet_available(packet),
            None => {
                self.slots[index].replace(packet);
            }
        }
        Ok(())
    }

    /// Whether `packet` is one of the two pool slots.
    pub fn is_member(&self, packet: &Packet) -> bool {
        let addr = core::ptr::from_ref::<Packet>(packet) as usize;
        self.slot_addrs.iter().any(|&slot| slot == addr)
    }

    pub(crate) fn has_waiter(&self) -> bool {
        self.pending_free_waiter.is_some()
    }

    #[cfg(test)]
    pub(crate) fn free_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    extern crate std;
    use std::boxed::Box;

    fn static_packet() -> &'static mut Packet {
        Box::leak(Box::new(Packet::new()))
    }

    fn static_pool() -> &'static PacketPool<'static> {
        Box::leak(Box::new(PacketPool::new(static_packet(), static_packet())))
    }

    struct Collector {
        received: Cell<usize>,
        stash: TakeCell<'static, Packet>,
    }

    impl Collector {
        fn new() -> Collector {
            Collector {
                received: Cell::new(0),
                stash: TakeCell::empty(),
            }
        }
    }

    impl FreePacketClient for Collector {
        fn packet_available(&self, packet: &'static mut Packet) {
            self.received.set(self.received.get() + 1);
            self.stash.replace(packet);
        }
    }

    #[test]
    fn acquire_release_restores_pool() {
        let pool = static_pool();
        assert_eq!(pool.free_count(), 2);
        let p = pool.try_acquire_now().unwrap();
        assert_eq!(pool.free_count(), 1);
        pool.release(p).unwrap();
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = static_pool();
        let _p0 = pool.try_acquire_now().unwrap();
        let _p1 = pool.try_acquire_now().unwrap();
        assert!(pool.try_acquire_now().is_none());
    }

    #[test]
    fn async_acquire_is_synchronous_when_free() {
        let pool = static_pool();
        let client: &'static Collector = Box::leak(Box::new(Collector::new()));
        pool.acquire_async(client).unwrap();
        assert_eq!(client.received.get(), 1);
        assert!(!pool.has_waiter());
    }

    #[test]
    fn waiter_parks_only_when_exhausted() {
        let pool = static_pool();
        let p0 = pool.try_acquire_now().unwrap();
        let _p1 = pool.try_acquire_now().unwrap();

        let client: &'static Collector = Box::leak(Box::new(Collector::new()));
        pool.acquire_async(client).unwrap();
        assert_eq!(client.received.get(), 0);
        assert!(pool.has_waiter());

        // Ownership moves straight to the waiter; the slot stays empty.
        pool.release(p0).unwrap();
        assert_eq!(client.received.get(), 1);
        assert!(!pool.has_waiter());
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn second_waiter_is_rejected() {
        let pool = static_pool();
        let _p0 = pool.try_acquire_now().unwrap();
        let _p1 = pool.try_acquire_now().unwrap();

        let first: &'static Collector = Box::leak(Box::new(Collector::new()));
        let second: &'static Collector = Box::leak(Box::new(Collector::new()));
        pool.acquire_async(first).unwrap();
        assert_eq!(pool.acquire_async(second), Err(ErrorCode::ALREADY));
        assert!(pool.has_waiter());
    }

    #[test]
    fn foreign_packet_is_rejected() {
        let pool = static_pool();
        let foreign = static_packet();
        let Err((code, _packet)) = pool.release(foreign) else {
            panic!("foreign release accepted");
        };
        assert_eq!(code, ErrorCode::INVAL);
        assert_eq!(pool.free_count(), 2);
    }

    /// A waiter that immediately re-registers itself from inside its own
    /// callback, which only works because the pool clears the waiter slot
    /// before invoking it.
    struct Reacquirer {
        pool: &'static PacketPool<'static>,
        me: Cell<Option<&'static Reacquirer>>,
        received: Cell<usize>,
        stash: TakeCell<'static, Packet>,
    }

    impl FreePacketClient for Reacquirer {
        fn packet_available(&self, packet: &'static mut Packet) {
            self.received.set(self.received.get() + 1);
            self.stash.replace(packet);
            if self.received.get() == 1 {
                self.pool.acquire_async(self.me.get().unwrap()).unwrap();
            }
        }
    }

    #[test]
    fn waiter_may_reregister_inside_callback() {
        let pool = static_pool();
        let p0 = pool.try_acquire_now().unwrap();
        let p1 = pool.try_acquire_now().unwrap();

        let client: &'static Reacquirer = Box::leak(Box::new(Reacquirer {
            pool,
            me: Cell::new(None),
            received: Cell::new(0),
            stash: TakeCell::empty(),
        }));
        client.me.set(Some(client));

        pool.acquire_async(client).unwrap();
        pool.release(p0).unwrap();
        // First handoff happened and the re-registration parked again.
        assert_eq!(client.received.get(), 1);
        assert!(pool.has_waiter());
        pool.release(p1).unwrap();
        assert_eq!(client.received.get(), 2);
        assert!(!pool.has_waiter());
    }
}
