//! The FIG carousel: schedules the FIG producers into the FIBs of each
//! frame, honouring per-FIG repetition rates through deadline-driven
//! packing.

pub mod fig0;
pub mod fig1;
pub mod fig2;
pub mod transition;

use std::collections::BTreeSet;
use std::time::Instant;

use log::{error, info};

use crate::dab::Ensemble;
use crate::utils::calc_crc16_ccitt;

/// Usable FIG bytes per FIB.
pub const FIB_DATA_LEN: usize = 30;

/// FIB size on the wire, data plus CRC.
pub const FIB_LEN: usize = 32;

/// Result of a single `fill` call.
#[derive(Debug, Default, Clone, Copy)]
pub struct FillStatus {
    pub written: usize,
    /// True when the producer transmitted the end of its content and its
    /// rotation cursor rewound; resets the scheduling deadline.
    pub complete: bool,
}

/// Repetition rate classes with their nominal maximum period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rate {
    A,
    B,
    C,
    D,
    E,
}

impl Rate {
    pub fn period_ms(self) -> i64 {
        match self {
            Rate::A => 96,
            Rate::B => 1_000,
            Rate::C => 10_000,
            Rate::D => 30_000,
            Rate::E => 120_000,
        }
    }
}

/// Everything a producer may read during `fill`. The ensemble reference is
/// handed in per frame; producers keep only cursor state across calls.
pub struct FigContext<'a> {
    pub ensemble: &'a Ensemble,
    pub current_frame: u64,
    /// Wall clock, seconds since the Unix epoch, for FIG 0/10.
    pub unix_time: i64,
    /// Steady clock for announcement transitions.
    pub now: Instant,
}

impl<'a> FigContext<'a> {
    #[cfg(test)]
    pub fn for_tests(ensemble: &'a Ensemble) -> Self {
        FigContext {
            ensemble,
            current_frame: 0,
            unix_time: 1_700_000_000,
            now: Instant::now(),
        }
    }
}

/// The FIG producers, dispatched through a plain `match` in the carousel
/// inner loop.
#[derive(Debug)]
pub enum Fig {
    F0_0(fig0::Fig0_0),
    F0_1(fig0::Fig0_1),
    F0_2(fig0::Fig0_2),
    F0_3(fig0::Fig0_3),
    F0_5(fig0::Fig0_5),
    F0_6(fig0::Fig0_6),
    F0_7(fig0::Fig0_7),
    F0_8(fig0::Fig0_8),
    F0_9(fig0::Fig0_9),
    F0_10(fig0::Fig0_10),
    F0_13(fig0::Fig0_13),
    F0_14(fig0::Fig0_14),
    F0_17(fig0::Fig0_17),
    F0_18(fig0::Fig0_18),
    F0_19(fig0::Fig0_19),
    F0_21(fig0::Fig0_21),
    F0_24(fig0::Fig0_24),
    F1_0(fig1::Fig1_0),
    F1_1(fig1::Fig1ServiceLabels),
    F1_4(fig1::Fig1_4),
    F1_5(fig1::Fig1ServiceLabels),
    F2_0(fig2::Fig2_0),
    F2_1(fig2::Fig2ServiceLabels),
    F2_4(fig2::Fig2_4),
    F2_5(fig2::Fig2ServiceLabels),
}

impl Fig {
    fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        match self {
            Fig::F0_0(f) => f.fill(ctx, buf),
            Fig::F0_1(f) => f.fill(ctx, buf),
            Fig::F0_2(f) => f.fill(ctx, buf),
            Fig::F0_3(f) => f.fill(ctx, buf),
            Fig::F0_5(f) => f.fill(ctx, buf),
            Fig::F0_6(f) => f.fill(ctx, buf),
            Fig::F0_7(f) => f.fill(ctx, buf),
            Fig::F0_8(f) => f.fill(ctx, buf),
            Fig::F0_9(f) => f.fill(ctx, buf),
            Fig::F0_10(f) => f.fill(ctx, buf),
            Fig::F0_13(f) => f.fill(ctx, buf),
            Fig::F0_14(f) => f.fill(ctx, buf),
            Fig::F0_17(f) => f.fill(ctx, buf),
            Fig::F0_18(f) => f.fill(ctx, buf),
            Fig::F0_19(f) => f.fill(ctx, buf),
            Fig::F0_21(f) => f.fill(ctx, buf),
            Fig::F0_24(f) => f.fill(ctx, buf),
            Fig::F1_0(f) => f.fill(ctx, buf),
            Fig::F1_1(f) => f.fill(ctx, buf),
            Fig::F1_4(f) => f.fill(ctx, buf),
            Fig::F1_5(f) => f.fill(ctx, buf),
            Fig::F2_0(f) => f.fill(ctx, buf),
            Fig::F2_1(f) => f.fill(ctx, buf),
            Fig::F2_4(f) => f.fill(ctx, buf),
            Fig::F2_5(f) => f.fill(ctx, buf),
        }
    }

    pub fn figtype(&self) -> u8 {
        match self {
            Fig::F0_0(_)
            | Fig::F0_1(_)
            | Fig::F0_2(_)
            | Fig::F0_3(_)
            | Fig::F0_5(_)
            | Fig::F0_6(_)
            | Fig::F0_7(_)
            | Fig::F0_8(_)
            | Fig::F0_9(_)
            | Fig::F0_10(_)
            | Fig::F0_13(_)
            | Fig::F0_14(_)
            | Fig::F0_17(_)
            | Fig::F0_18(_)
            | Fig::F0_19(_)
            | Fig::F0_21(_)
            | Fig::F0_24(_) => 0,
            Fig::F1_0(_) | Fig::F1_1(_) | Fig::F1_4(_) | Fig::F1_5(_) => 1,
            Fig::F2_0(_) | Fig::F2_1(_) | Fig::F2_4(_) | Fig::F2_5(_) => 2,
        }
    }

    pub fn figextension(&self) -> u8 {
        match self {
            Fig::F0_0(_) => 0,
            Fig::F0_1(_) => 1,
            Fig::F0_2(_) => 2,
            Fig::F0_3(_) => 3,
            Fig::F0_5(_) => 5,
            Fig::F0_6(_) => 6,
            Fig::F0_7(_) => 7,
            Fig::F0_8(_) => 8,
            Fig::F0_9(_) => 9,
            Fig::F0_10(_) => 10,
            Fig::F0_13(_) => 13,
            Fig::F0_14(_) => 14,
            Fig::F0_17(_) => 17,
            Fig::F0_18(_) => 18,
            Fig::F0_19(_) => 19,
            Fig::F0_21(_) => 21,
            Fig::F0_24(_) => 24,
            Fig::F1_0(_) => 0,
            Fig::F1_1(f) => f.extension(),
            Fig::F1_4(_) => 4,
            Fig::F1_5(f) => f.extension(),
            Fig::F2_0(_) => 0,
            Fig::F2_1(f) => f.extension(),
            Fig::F2_4(_) => 4,
            Fig::F2_5(f) => f.extension(),
        }
    }

    pub fn repetition_rate(&self) -> Rate {
        match self {
            Fig::F0_0(_) | Fig::F0_1(_) | Fig::F0_2(_) | Fig::F0_3(_) | Fig::F0_7(_) => Rate::A,
            Fig::F0_5(_) | Fig::F0_6(_) | Fig::F0_8(_) | Fig::F0_9(_) | Fig::F0_10(_) => Rate::B,
            Fig::F0_13(_) | Fig::F0_14(_) | Fig::F0_17(_) | Fig::F0_18(_) => Rate::C,
            Fig::F0_19(f) => f.rate(),
            Fig::F0_21(_) | Fig::F0_24(_) => Rate::E,
            Fig::F1_0(_) | Fig::F1_1(_) => Rate::B,
            Fig::F1_4(_) | Fig::F1_5(_) => Rate::C,
            Fig::F2_0(_) | Fig::F2_1(_) => Rate::C,
            Fig::F2_4(_) | Fig::F2_5(_) => Rate::D,
        }
    }
}

/// Which FIB a producer is allocated to. Only FIG 0/0 and FIG 0/7 have a
/// defined location (FIB 0); everything else may go anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FibAllocation {
    Fib0,
    Fib1,
    Fib2,
    FibAny,
}

#[derive(Debug)]
struct CarouselElement {
    fig: Fig,
    alloc: FibAllocation,
    /// Milliseconds until the repetition contract is violated.
    deadline: i64,
    last_rate: Rate,
}

impl CarouselElement {
    fn increase_deadline(&mut self) {
        self.deadline = self.fig.repetition_rate().period_ms();
    }

    /// Clamp the deadline if the producer changed its rate since we last
    /// set it.
    fn check_deadline(&mut self) -> bool {
        let new_rate = self.fig.repetition_rate();
        let rate_changed = self.last_rate != new_rate;
        if rate_changed {
            let new_deadline = new_rate.period_ms();
            if self.deadline > new_deadline {
                self.deadline = new_deadline;
            }
            self.last_rate = new_rate;
        }
        rate_changed
    }
}

#[derive(Debug)]
pub struct FigCarousel {
    elements: Vec<CarouselElement>,
    missed_deadlines: BTreeSet<(u8, u8)>,
}

impl Default for FigCarousel {
    fn default() -> Self {
        Self::new()
    }
}

impl FigCarousel {
    pub fn new() -> Self {
        let mut carousel = FigCarousel {
            elements: Vec::new(),
            missed_deadlines: BTreeSet::new(),
        };

        // FIG 0/0 and 0/7 have a fixed place at the start of FIB 0, the
        // rest goes wherever there is room.
        carousel.load(Fig::F0_0(fig0::Fig0_0::default()), FibAllocation::Fib0);
        carousel.load(Fig::F0_7(fig0::Fig0_7), FibAllocation::Fib0);
        carousel.load(Fig::F0_1(fig0::Fig0_1::default()), FibAllocation::FibAny);
        carousel.load(Fig::F0_2(fig0::Fig0_2::default()), FibAllocation::FibAny);
        carousel.load(Fig::F0_3(fig0::Fig0_3::default()), FibAllocation::FibAny);
        carousel.load(Fig::F0_5(fig0::Fig0_5::default()), FibAllocation::FibAny);
        carousel.load(Fig::F0_6(fig0::Fig0_6::default()), FibAllocation::FibAny);
        carousel.load(Fig::F0_8(fig0::Fig0_8::default()), FibAllocation::FibAny);
        carousel.load(Fig::F0_9(fig0::Fig0_9), FibAllocation::FibAny);
        carousel.load(Fig::F0_10(fig0::Fig0_10::default()), FibAllocation::FibAny);
        carousel.load(Fig::F0_13(fig0::Fig0_13::default()), FibAllocation::FibAny);
        carousel.load(Fig::F0_14(fig0::Fig0_14::default()), FibAllocation::FibAny);
        carousel.load(Fig::F0_17(fig0::Fig0_17::default()), FibAllocation::FibAny);
        carousel.load(Fig::F0_18(fig0::Fig0_18::default()), FibAllocation::FibAny);
        carousel.load(Fig::F0_19(fig0::Fig0_19::default()), FibAllocation::FibAny);
        carousel.load(Fig::F0_21(fig0::Fig0_21::default()), FibAllocation::FibAny);
        carousel.load(Fig::F0_24(fig0::Fig0_24::default()), FibAllocation::FibAny);
        carousel.load(Fig::F1_0(fig1::Fig1_0), FibAllocation::FibAny);
        carousel.load(
            Fig::F1_1(fig1::Fig1ServiceLabels::new(true)),
            FibAllocation::FibAny,
        );
        carousel.load(Fig::F1_4(fig1::Fig1_4::default()), FibAllocation::FibAny);
        carousel.load(
            Fig::F1_5(fig1::Fig1ServiceLabels::new(false)),
            FibAllocation::FibAny,
        );
        carousel.load(Fig::F2_0(fig2::Fig2_0::default()), FibAllocation::FibAny);
        carousel.load(
            Fig::F2_1(fig2::Fig2ServiceLabels::new(true)),
            FibAllocation::FibAny,
        );
        carousel.load(Fig::F2_4(fig2::Fig2_4::default()), FibAllocation::FibAny);
        carousel.load(
            Fig::F2_5(fig2::Fig2ServiceLabels::new(false)),
            FibAllocation::FibAny,
        );

        carousel
    }

    fn load(&mut self, fig: Fig, alloc: FibAllocation) {
        let last_rate = fig.repetition_rate();
        let deadline = last_rate.period_ms();
        self.elements.push(CarouselElement {
            fig,
            alloc,
            deadline,
            last_rate,
        });
    }

    /// Assemble `fib_count` FIBs (3 or 4 depending on the transmission
    /// mode) for the given frame. Returns `fib_count * 32` bytes.
    pub fn write_fibs(&mut self, ctx: &FigContext, fib_count: usize) -> Vec<u8> {
        for element in &mut self.elements {
            element.deadline -= 24;
            if element.deadline < 0 {
                self.missed_deadlines
                    .insert((element.fig.figtype(), element.fig.figextension()));
            }
        }

        if ctx.current_frame % 250 == 0 && !self.missed_deadlines.is_empty() {
            let list: Vec<String> = self
                .missed_deadlines
                .iter()
                .map(|(t, e)| format!("{}/{}", t, e))
                .collect();
            self.missed_deadlines.clear();
            info!(
                "Could not respect repetition rates for FIGs: {}",
                list.join(" ")
            );
        }

        let mut out = Vec::with_capacity(fib_count * FIB_LEN);
        for fib in 0..fib_count {
            let mut data = [0u8; FIB_DATA_LEN];
            let used = self.pack_fib(fib, ctx, &mut data);
            if used < FIB_DATA_LEN {
                data[used] = 0xFF; // end marker
            }
            out.extend_from_slice(&data);
            out.extend_from_slice(&calc_crc16_ccitt(&data).to_be_bytes());
        }
        out
    }

    /// Fill one FIB with the earliest-deadline producers allocated to it.
    fn pack_fib(&mut self, fib: usize, ctx: &FigContext, data: &mut [u8; FIB_DATA_LEN]) -> usize {
        let alloc = match fib {
            0 => Some(FibAllocation::Fib0),
            1 => Some(FibAllocation::Fib1),
            2 => Some(FibAllocation::Fib2),
            _ => None, // FIB 3 only carries FIB_ANY producers
        };

        let mut candidates: Vec<usize> = self
            .elements
            .iter()
            .enumerate()
            .filter(|(_, e)| Some(e.alloc) == alloc || e.alloc == FibAllocation::FibAny)
            .map(|(i, _)| i)
            .collect();

        for &i in &candidates {
            self.elements[i].check_deadline();
        }

        candidates.sort_by_key(|&i| self.elements[i].deadline);

        let mut pos = 0;
        let framephase = ctx.current_frame % 4;

        // FIG 0/0 must be the first FIG of the FIB, FIG 0/7 directly after
        // it; neither is ever transmitted anywhere else.
        let fig0_0 = candidates
            .iter()
            .position(|&i| self.elements[i].fig.figtype() == 0
                && self.elements[i].fig.figextension() == 0);
        let fig0_7 = candidates
            .iter()
            .position(|&i| self.elements[i].fig.figtype() == 0
                && self.elements[i].fig.figextension() == 7);

        if let Some(k) = fig0_0 {
            if framephase == 0 {
                let i = candidates[k];
                let status = self.elements[i].fig.fill(ctx, &mut data[pos..]);
                if status.written == 0 || !status.complete {
                    error!("FIG 0/0 did not complete");
                } else {
                    pos += status.written;
                    self.elements[i].increase_deadline();
                }

                if let Some(k7) = fig0_7 {
                    let i7 = candidates[k7];
                    let status = self.elements[i7].fig.fill(ctx, &mut data[pos..]);
                    pos += status.written;
                    if status.complete {
                        self.elements[i7].increase_deadline();
                    }
                }
            }
        }
        candidates.retain(|&i| {
            let fig = &self.elements[i].fig;
            !(fig.figtype() == 0 && (fig.figextension() == 0 || fig.figextension() == 7))
        });

        for &i in &candidates {
            if pos >= FIB_DATA_LEN {
                break;
            }
            let element = &mut self.elements[i];
            let status = element.fig.fill(ctx, &mut data[pos..]);

            // A bare 2-byte FIG header with no content must never be
            // emitted.
            if status.written == 1 || status.written == 2 {
                error!(
                    "FIG {}/{} wrote only {} bytes",
                    element.fig.figtype(),
                    element.fig.figextension(),
                    status.written
                );
                continue;
            }

            pos += status.written;
            if status.complete {
                element.increase_deadline();
            }
        }

        pos
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dab::{
        Component, InputDescriptor, Label, Protection, Service, Subchannel, SubchannelType,
    };

    pub fn test_ensemble() -> Ensemble {
        Ensemble {
            id: 0xABCD,
            ecc: 0xE1,
            mode: 1,
            lto: 0,
            international_table: 1,
            label: Label::new("Test", None).unwrap(),
            services: vec![Service {
                id: 0x1000,
                pty: 0,
                language: 0,
                program: true,
                label: Label::new("Test", None).unwrap(),
                announcements: None,
            }],
            components: vec![Component {
                service_id: 0x1000,
                subchannel_id: 1,
                scids: 0,
                ty: 63,
                label: Label::default(),
                packet: None,
                fec_scheme: None,
                user_applications: Vec::new(),
            }],
            subchannels: vec![Subchannel {
                id: 1,
                ty: SubchannelType::DabPlusAudio,
                start_address: 0,
                bitrate: 128,
                protection: Protection::Eep { option: 0, level: 2 },
                input: InputDescriptor::default(),
            }],
            clusters: Vec::new(),
            linkage_sets: Vec::new(),
            frequency_information: Vec::new(),
            other_ensemble_services: Vec::new(),
            reconfig_counter: 0,
        }
    }

    /// Parse the FIGs of one 32-byte FIB into (type, extension) pairs.
    pub fn parse_fib(fib: &[u8]) -> Vec<(u8, u8)> {
        assert_eq!(fib.len(), FIB_LEN);
        let mut figs = Vec::new();
        let mut offset = 0;
        while offset < FIB_DATA_LEN && fib[offset] != 0xFF {
            let figtype = fib[offset] >> 5;
            let length = (fib[offset] & 0x1F) as usize;
            assert!(offset + 1 + length <= FIB_DATA_LEN, "FIG spans FIB boundary");
            let ext = match figtype {
                0 => fib[offset + 1] & 0x1F,
                1 => fib[offset + 1] & 0x07,
                2 => fib[offset + 1] & 0x07,
                other => panic!("unexpected FIG type {}", other),
            };
            figs.push((figtype, ext));
            offset += 1 + length;
        }
        figs
    }

    #[test]
    fn fib_crc_and_size() {
        let ensemble = test_ensemble();
        let mut carousel = FigCarousel::new();
        let ctx = FigContext::for_tests(&ensemble);

        let fic = carousel.write_fibs(&ctx, 3);
        assert_eq!(fic.len(), 96);

        for fib in fic.chunks(FIB_LEN) {
            let crc = u16::from_be_bytes([fib[30], fib[31]]);
            assert_eq!(crc, calc_crc16_ccitt(&fib[..30]));
        }
    }

    #[test]
    fn fig0_0_first_in_fib0_every_fourth_frame() {
        let ensemble = test_ensemble();
        let mut carousel = FigCarousel::new();

        for frame in 0..8u64 {
            let ctx = FigContext {
                current_frame: frame,
                ..FigContext::for_tests(&ensemble)
            };
            let fic = carousel.write_fibs(&ctx, 3);

            let mut count_0_0 = 0;
            for (fib_index, fib) in fic.chunks(FIB_LEN).enumerate() {
                let figs = parse_fib(fib);
                for (k, &fig) in figs.iter().enumerate() {
                    if fig == (0, 0) {
                        count_0_0 += 1;
                        assert_eq!(fib_index, 0, "FIG 0/0 outside FIB0");
                        assert_eq!(k, 0, "FIG 0/0 not first in FIB0");
                    }
                }
            }

            if frame % 4 == 0 {
                assert_eq!(count_0_0, 1, "frame {}", frame);
            } else {
                assert_eq!(count_0_0, 0, "frame {}", frame);
            }
        }
    }

    #[test]
    fn fig0_1_encodes_subchannel() {
        let ensemble = test_ensemble();
        let mut fig = fig0::Fig0_1::default();
        let ctx = FigContext::for_tests(&ensemble);

        let mut buf = [0u8; 30];
        let status = fig.fill(&ctx, &mut buf);
        assert!(status.complete);
        // header + 4-byte long form entry
        assert_eq!(status.written, 6);
        assert_eq!(buf[0], 5); // FIG 0, length 5
        assert_eq!(buf[1], 0x01);
        // SubChId 1, SAD 0
        assert_eq!(buf[2], 1 << 2);
        assert_eq!(buf[3], 0);
        // long form, option 0, level 2 (EEP 3-A), size 96 CU
        assert_eq!(buf[4], 0x80 | (2 << 2));
        assert_eq!(buf[5], 96);
    }

    #[test]
    fn rates_are_respected_over_a_window() {
        let ensemble = test_ensemble();
        let mut carousel = FigCarousel::new();

        // Collect FIG emissions over 1 s worth of frames and check the
        // fast and medium rate contracts of this small ensemble.
        let mut seen_1_0_at = Vec::new();
        let mut seen_0_1_at = Vec::new();
        for frame in 0..42u64 {
            let ctx = FigContext {
                current_frame: frame,
                ..FigContext::for_tests(&ensemble)
            };
            let fic = carousel.write_fibs(&ctx, 3);
            for fib in fic.chunks(FIB_LEN) {
                for fig in parse_fib(fib) {
                    match fig {
                        (1, 0) => seen_1_0_at.push(frame),
                        (0, 1) => seen_0_1_at.push(frame),
                        _ => {}
                    }
                }
            }
        }

        // FIG 1/0 is rate B: at least one emission within 1 s
        assert!(!seen_1_0_at.is_empty());
        // FIG 0/1 is rate A: emissions at most 4 frames (96 ms) apart
        assert!(!seen_0_1_at.is_empty());
        for pair in seen_0_1_at.windows(2) {
            assert!(pair[1] - pair[0] <= 4, "FIG 0/1 gap too large: {:?}", pair);
        }
    }
}
