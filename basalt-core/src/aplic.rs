//! Advanced platform-level interrupt controller (APLIC), single machine-level domain.
//!
//! Wired device interrupts are latched here per `sourcecfg` (edge or level sense), then
//! delivered either directly (per-hart `topi`/`claimi`, driving MEIP) or as MSIs into the
//! IMSIC. Only the root domain is modeled; delegation is out of scope for this platform.

use crate::imsic::{FileKind, Imsic};
use log::trace;
use std::sync::{Arc, Mutex};

/// Source sense configuration.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum SourceMode {
    #[default]
    Inactive,
    Detached,
    RisingEdge,
    FallingEdge,
    LevelHigh,
    LevelLow,
}

impl SourceMode {
    fn from_sourcecfg(value: u32) -> Self {
        match value & 0x7 {
            1 => Self::Detached,
            4 => Self::RisingEdge,
            5 => Self::FallingEdge,
            6 => Self::LevelHigh,
            7 => Self::LevelLow,
            _ => Self::Inactive,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Source {
    mode: SourceMode,
    /// Last wire level observed, for edge detection.
    wire: bool,
    pending: bool,
    enabled: bool,
    /// Direct mode: (hart, priority). MSI mode: (hart, eiid).
    target_hart: usize,
    target_value: u32,
}

/// Delivery mode of the domain.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum DeliveryMode {
    #[default]
    Direct,
    Msi,
}

/// The root-domain APLIC.
#[derive(Debug)]
pub struct Aplic {
    sources: Vec<Source>,
    /// domaincfg.IE: global interrupt enable.
    enabled: bool,
    mode: DeliveryMode,
    hart_count: usize,
    /// Per-hart idelivery/ithreshold of the direct-mode IDC.
    idelivery: Vec<bool>,
    ithreshold: Vec<u32>,
    imsic: Option<Arc<Mutex<Imsic>>>,
}

impl Aplic {
    pub fn new(num_sources: usize, hart_count: usize) -> Self {
        Self {
            sources: vec![Source::default(); num_sources + 1],
            enabled: false,
            mode: DeliveryMode::Direct,
            hart_count,
            idelivery: vec![false; hart_count],
            ithreshold: vec![0; hart_count],
            imsic: None,
        }
    }

    /// Attach the IMSIC used for MSI delivery mode.
    pub fn connect_imsic(&mut self, imsic: Arc<Mutex<Imsic>>) {
        self.imsic = Some(imsic);
    }

    pub fn set_domain(&mut self, enabled: bool, mode: DeliveryMode) {
        self.enabled = enabled;
        self.mode = mode;
    }

    pub fn configure_source(&mut self, source: usize, sourcecfg: u32) {
        if let Some(s) = self.sources.get_mut(source) {
            s.mode = SourceMode::from_sourcecfg(sourcecfg);
            if s.mode == SourceMode::Inactive {
                s.pending = false;
                s.enabled = false;
            }
        }
    }

    pub fn set_target(&mut self, source: usize, hart: usize, value: u32) {
        if let Some(s) = self.sources.get_mut(source) {
            s.target_hart = hart.min(self.hart_count.saturating_sub(1));
            s.target_value = value;
        }
    }

    pub fn set_enabled(&mut self, source: usize, enabled: bool) {
        if let Some(s) = self.sources.get_mut(source) {
            if s.mode != SourceMode::Inactive {
                s.enabled = enabled;
            }
        }
    }

    pub fn set_pending(&mut self, source: usize, pending: bool) {
        if let Some(s) = self.sources.get_mut(source) {
            if s.mode != SourceMode::Inactive {
                s.pending = pending;
            }
        }
    }

    pub fn set_idelivery(&mut self, hart: usize, enabled: bool) {
        self.idelivery[hart] = enabled;
    }

    pub fn set_ithreshold(&mut self, hart: usize, threshold: u32) {
        self.ithreshold[hart] = threshold;
    }

    /// Drive a source's wire. Edge sources latch pending on the configured transition,
    /// level sources track the (possibly inverted) level.
    pub fn set_source_wire(&mut self, source: usize, level: bool) {
        let Some(s) = self.sources.get_mut(source) else {
            return;
        };
        let was = s.wire;
        s.wire = level;
        match s.mode {
            SourceMode::Inactive | SourceMode::Detached => {}
            SourceMode::RisingEdge => {
                if level && !was {
                    s.pending = true;
                }
            }
            SourceMode::FallingEdge => {
                if !level && was {
                    s.pending = true;
                }
            }
            SourceMode::LevelHigh => s.pending = level,
            SourceMode::LevelLow => s.pending = !level,
        }
        if s.pending {
            trace!(source; "APLIC source pending");
        }
        self.forward_msis();
    }

    // In MSI mode, pending enabled sources are immediately converted to IMSIC deliveries
    // and their pending state cleared (edge semantics).
    fn forward_msis(&mut self) {
        if !self.enabled || self.mode != DeliveryMode::Msi {
            return;
        }
        let Some(imsic) = self.imsic.clone() else {
            return;
        };
        for s in self.sources.iter_mut().skip(1) {
            if s.pending && s.enabled {
                s.pending = false;
                imsic
                    .lock()
                    .unwrap()
                    .deliver(s.target_hart, FileKind::Supervisor, s.target_value);
            }
        }
    }

    /// Direct mode: the highest-priority pending-and-enabled source targeting `hart`,
    /// as `(source, priority)`. Smaller priority values win; ties go to the lower source.
    pub fn topi(&self, hart: usize) -> Option<(usize, u32)> {
        if !self.enabled || self.mode != DeliveryMode::Direct || !self.idelivery[hart] {
            return None;
        }
        let threshold = self.ithreshold[hart];
        let mut best: Option<(usize, u32)> = None;
        for (ix, s) in self.sources.iter().enumerate().skip(1) {
            if !s.pending || !s.enabled || s.target_hart != hart {
                continue;
            }
            let priority = s.target_value.max(1);
            if threshold != 0 && priority >= threshold {
                continue;
            }
            if best.map(|(_, p)| priority < p).unwrap_or(true) {
                best = Some((ix, priority));
            }
        }
        best
    }

    /// Direct mode: claim the top interrupt for `hart`, clearing its pending bit.
    pub fn claimi(&mut self, hart: usize) -> Option<(usize, u32)> {
        let (source, priority) = self.topi(hart)?;
        self.sources[source].pending = false;
        Some((source, priority))
    }

    /// Whether the external-interrupt line toward `hart` is asserted (direct mode).
    pub fn external_pending(&self, hart: usize) -> bool {
        self.topi(hart).is_some()
    }
}
