// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2026.

//! GPIO interfaces the link depends on.

/// A software-driven output pin.
///
/// The link uses one instance for the active-low chip select: `clear()`
/// asserts the select, `set()` releases it.
pub trait Pin {
    /// Drive the pin high.
    fn set(&self);

    /// Drive the pin low.
    fn clear(&self);
}

/// The downstream-driven ready line.
///
/// Downstream pulses this line low when it will service the next SPI
/// frame. Boards configure the falling-edge interrupt and call
/// [`Link::ready_edge`](crate::link::Link::ready_edge) from the handler;
/// the link itself only samples the level, once, at initialization, in
/// case downstream signalled readiness before the upstream booted.
pub trait ReadyLine {
    /// Whether the line is currently asserted (low).
    fn is_asserted(&self) -> bool;
}
