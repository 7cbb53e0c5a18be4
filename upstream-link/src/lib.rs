// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2026.

//! Upstream half of an inter-processor SPI packet link.
//!
//! Two microcontrollers sit either side of a trust boundary: the upstream
//! processor faces the host, the downstream processor faces untrusted
//! devices. They exchange fixed-structure command packets over a SPI bus
//! with hardware CRC. Each packet crosses the wire as two frames, a size
//! frame followed by a body frame, and each frame is gated by a falling
//! edge on a downstream-driven ready line.
//!
//! This crate is the upstream link controller: the state machine that
//! sequences those frames, the two-slot packet pool whose buffers are
//! loaned to upper layers and to the SPI peripheral without ever being
//! copied or double-owned, and the completion plumbing that keeps the SPI
//! interrupt, the ready-edge interrupt, and the upper-layer entry points
//! from observing a half-updated link.
//!
//! The hardware the controller drives sits behind the traits in [`hil`]:
//! boards provide a full-duplex word-transfer SPI primitive, a chip-select
//! pin, the ready-line input, and a critical-section primitive that masks
//! the link's interrupt sources. Nothing in this crate touches a register.
//!
//! Usage
//! -----
//!
//! ```rust,ignore
//! static mut PACKET_0: Packet = Packet::new();
//! static mut PACKET_1: Packet = Packet::new();
//!
//! let pool = static_init!(PacketPool, PacketPool::new(&mut PACKET_0, &mut PACKET_1));
//! let link = static_init!(
//!     Link<'static>,
//!     Link::new(spi, &nss_pin, &ready_line, &region, pool)
//! );
//! spi.set_client(link);
//! link.initialize();
//!
//! // From the downstream-ready EXTI handler:
//! link.ready_edge();
//!
//! // From the main loop:
//! loop {
//!     link.service();
//!     // ...
//! }
//! ```

#![forbid(unsafe_code)]
#![no_std]

pub mod errorcode;
pub mod hil;
pub mod link;
pub mod packet;
pub mod pool;
pub mod utilities;

pub use crate::errorcode::ErrorCode;
