//! FIG type 0: Multiplex Configuration Information and service information.
//!
//! Each producer writes complete FIGs only; a producer that cannot fit its
//! next unit in the remaining FIB space returns 0 bytes. Producers over
//! lists keep a rotating cursor and report completion when the cursor
//! wraps.

use std::time::Duration;

use crate::dab::{Component, FecScheme, Protection, SubchannelType};

use super::transition::TransitionHandler;
use super::{FigContext, FillStatus, Rate};

/// Seconds an announcement stays in the `new`/`disabled` bucket, keeping
/// FIG 0/19 at the fast rate around the transition.
const ANNOUNCEMENT_TRANSITION_TIMEOUT: Duration = Duration::from_secs(2);

fn fig0_header(buf: &mut [u8], ext: u8, pd: bool, payload_len: usize) {
    buf[0] = ((payload_len + 1) as u8) & 0x1F;
    buf[1] = ((pd as u8) << 5) | (ext & 0x1F);
}

/// Write a complete FIG 0 built from `payload`. Returns 0 if it does not
/// fit.
fn write_fig0(buf: &mut [u8], ext: u8, pd: bool, payload: &[u8]) -> usize {
    let required = 2 + payload.len();
    if buf.len() < required || payload.is_empty() {
        return 0;
    }
    fig0_header(buf, ext, pd, payload.len());
    buf[2..required].copy_from_slice(payload);
    required
}

/// Rotating list producers share this packing loop: encode entries starting
/// at `cursor` into one FIG while they fit, advance the cursor, and report
/// completion when the whole list has been sent.
fn fill_rotating<T>(
    cursor: &mut usize,
    entries: &[T],
    ext: u8,
    pd: bool,
    buf: &mut [u8],
    mut encode: impl FnMut(&T) -> Option<Vec<u8>>,
) -> FillStatus {
    let mut payload = Vec::new();
    let available = buf.len().saturating_sub(2);

    while *cursor < entries.len() {
        match encode(&entries[*cursor]) {
            Some(entry) => {
                if payload.len() + entry.len() > available {
                    break;
                }
                payload.extend_from_slice(&entry);
                *cursor += 1;
            }
            None => *cursor += 1,
        }
    }

    let written = write_fig0(buf, ext, pd, &payload);
    if written == 0 && !payload.is_empty() {
        // did not fit at all; keep the cursor for the next call
        return FillStatus {
            written: 0,
            complete: false,
        };
    }

    let mut complete = false;
    if *cursor >= entries.len() {
        *cursor = 0;
        complete = true;
    }
    FillStatus { written, complete }
}

// ---------------------------------------------------------------- FIG 0/0

/// Ensemble information (MCI). Always the first FIG of FIB 0, emitted at
/// frame phase 0.
#[derive(Debug, Default)]
pub struct Fig0_0 {
    pub alarm: bool,
}

impl Fig0_0 {
    pub fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        let cif_high = ((ctx.current_frame / 250) % 20) as u8;
        let cif_low = (ctx.current_frame % 250) as u8;

        let eid = ctx.ensemble.id.to_be_bytes();
        let payload = [
            eid[0],
            eid[1],
            // change flag 0: no multiplex reconfiguration announced
            ((self.alarm as u8) << 5) | (cif_high & 0x1F),
            cif_low,
        ];
        let written = write_fig0(buf, 0, false, &payload);
        FillStatus {
            written,
            complete: written > 0,
        }
    }
}

// ---------------------------------------------------------------- FIG 0/1

/// Sub-channel organisation: start address, size and protection.
#[derive(Debug, Default)]
pub struct Fig0_1 {
    cursor: usize,
}

impl Fig0_1 {
    pub fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        fill_rotating(
            &mut self.cursor,
            &ctx.ensemble.subchannels,
            1,
            false,
            buf,
            |subch| {
                let mut entry = vec![
                    (subch.id << 2) | ((subch.start_address >> 8) as u8 & 0x03),
                    (subch.start_address & 0xFF) as u8,
                ];
                match subch.protection {
                    Protection::Uep {
                        table_switch,
                        table_index,
                    } => {
                        entry.push(((table_switch & 0x01) << 6) | (table_index & 0x3F));
                    }
                    Protection::Eep { option, level } => {
                        let size = subch.size_cu();
                        entry.push(
                            0x80 | ((option & 0x07) << 4)
                                | ((level & 0x03) << 2)
                                | ((size >> 8) as u8 & 0x03),
                        );
                        entry.push((size & 0xFF) as u8);
                    }
                }
                Some(entry)
            },
        )
    }
}

// ---------------------------------------------------------------- FIG 0/2

/// Service organisation: which components make up each service.
#[derive(Debug, Default)]
pub struct Fig0_2 {
    cursor: usize,
}

impl Fig0_2 {
    pub fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        let services = &ctx.ensemble.services;
        if services.is_empty() {
            return FillStatus {
                written: 0,
                complete: true,
            };
        }

        // All services in one FIG 0/2 share the P/D flag, so each call
        // packs a run of services with equal flag starting at the cursor.
        let pd = !ctx
            .ensemble
            .service_is_programme(&services[self.cursor.min(services.len() - 1)]);

        let mut payload = Vec::new();
        let available = buf.len().saturating_sub(2);

        while self.cursor < services.len() {
            let service = &services[self.cursor];
            let service_pd = !ctx.ensemble.service_is_programme(service);
            if service_pd != pd {
                break;
            }

            let components: Vec<&Component> =
                ctx.ensemble.components_of(service.id).collect();

            let mut entry = Vec::new();
            if pd {
                entry.extend_from_slice(&service.id.to_be_bytes());
            } else {
                entry.extend_from_slice(&(service.id as u16).to_be_bytes());
            }
            entry.push((components.len() as u8) & 0x0F);

            for component in &components {
                let primary = ctx.ensemble.is_primary(component);
                // CA never set
                let ps_ca = (primary as u8) << 1;

                match ctx.ensemble.get_subchannel(component.subchannel_id) {
                    Some(subch) => match subch.ty {
                        SubchannelType::DabAudio => {
                            entry.push(0x00);
                            entry.push((subch.id << 2) | ps_ca);
                        }
                        SubchannelType::DabPlusAudio => {
                            entry.push(63);
                            entry.push((subch.id << 2) | ps_ca);
                        }
                        SubchannelType::DataStream => {
                            entry.push((1 << 6) | (component.ty & 0x3F));
                            entry.push((subch.id << 2) | ps_ca);
                        }
                        SubchannelType::Packet => {
                            let scid = component.packet.as_ref().map(|p| p.id).unwrap_or(0);
                            entry.push((3 << 6) | ((scid >> 6) as u8 & 0x3F));
                            entry.push((((scid & 0x3F) as u8) << 2) | ps_ca);
                        }
                    },
                    None => continue,
                }
            }

            if payload.len() + entry.len() > available {
                break;
            }
            payload.extend_from_slice(&entry);
            self.cursor += 1;
        }

        let written = write_fig0(buf, 2, pd, &payload);
        if written == 0 && !payload.is_empty() {
            return FillStatus {
                written: 0,
                complete: false,
            };
        }

        let mut complete = false;
        if self.cursor >= services.len() {
            self.cursor = 0;
            complete = true;
        }
        FillStatus { written, complete }
    }
}

// ---------------------------------------------------------------- FIG 0/3

/// Service component description in packet mode.
#[derive(Debug, Default)]
pub struct Fig0_3 {
    cursor: usize,
}

impl Fig0_3 {
    pub fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        fill_rotating(
            &mut self.cursor,
            &ctx.ensemble.components,
            3,
            false,
            buf,
            |component| {
                let packet = component.packet.as_ref()?;
                Some(vec![
                    (packet.id >> 4) as u8,
                    ((packet.id & 0x0F) as u8) << 4,
                    ((packet.datagroup as u8) << 7) | (packet.dscty & 0x3F),
                    (component.subchannel_id << 2) | ((packet.address >> 8) as u8 & 0x03),
                    (packet.address & 0xFF) as u8,
                ])
            },
        )
    }
}

// ---------------------------------------------------------------- FIG 0/5

/// Service component language, short form.
#[derive(Debug, Default)]
pub struct Fig0_5 {
    cursor: usize,
}

impl Fig0_5 {
    pub fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        let ensemble = ctx.ensemble;
        fill_rotating(
            &mut self.cursor,
            &ensemble.components,
            5,
            false,
            buf,
            |component| {
                let language = ensemble.get_service(component.service_id)?.language;
                if language == 0 {
                    return None;
                }
                Some(vec![component.subchannel_id & 0x3F, language])
            },
        )
    }
}

// ---------------------------------------------------------------- FIG 0/6

/// Service linking information. Only DAB SId lists are transmitted.
#[derive(Debug, Default)]
pub struct Fig0_6 {
    cursor: usize,
}

impl Fig0_6 {
    pub fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        fill_rotating(
            &mut self.cursor,
            &ctx.ensemble.linkage_sets,
            6,
            false,
            buf,
            |set| {
                let mut entry = vec![
                    0x80 | ((set.active as u8) << 6)
                        | ((set.hard as u8) << 5)
                        | ((set.international as u8) << 4)
                        | ((set.lsn >> 8) as u8 & 0x0F),
                    (set.lsn & 0xFF) as u8,
                    // IdLQ 0: DAB SIds
                    (set.ids.len() as u8) & 0x0F,
                ];
                for id in &set.ids {
                    entry.extend_from_slice(&id.to_be_bytes());
                }
                Some(entry)
            },
        )
    }
}

// ---------------------------------------------------------------- FIG 0/7

/// Configuration information: service count and reconfiguration counter.
/// When present it directly follows FIG 0/0.
#[derive(Debug, Default)]
pub struct Fig0_7;

impl Fig0_7 {
    pub fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        let services = ctx.ensemble.services.len() as u8;
        let count = ctx.ensemble.reconfig_counter & 0x03FF;
        let payload = [
            (services << 2) | ((count >> 8) as u8 & 0x03),
            (count & 0xFF) as u8,
        ];
        let written = write_fig0(buf, 7, false, &payload);
        FillStatus {
            written,
            complete: written > 0,
        }
    }
}

// ---------------------------------------------------------------- FIG 0/8

/// Service component global definition.
#[derive(Debug, Default)]
pub struct Fig0_8 {
    cursor: usize,
}

impl Fig0_8 {
    pub fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        let components = &ctx.ensemble.components;
        if components.is_empty() {
            return FillStatus {
                written: 0,
                complete: true,
            };
        }

        let pd_of = |component: &Component| {
            ctx.ensemble
                .get_service(component.service_id)
                .map(|s| !ctx.ensemble.service_is_programme(s))
                .unwrap_or(false)
        };

        // Entries in one FIG share the P/D flag, as in FIG 0/2.
        let pd = pd_of(&components[self.cursor.min(components.len() - 1)]);

        let mut payload = Vec::new();
        let available = buf.len().saturating_sub(2);

        while self.cursor < components.len() {
            let component = &components[self.cursor];
            if pd_of(component) != pd {
                break;
            }

            let mut entry = Vec::new();
            if pd {
                entry.extend_from_slice(&component.service_id.to_be_bytes());
            } else {
                entry.extend_from_slice(&(component.service_id as u16).to_be_bytes());
            }
            entry.push(component.scids & 0x0F);

            match &component.packet {
                Some(packet) => {
                    entry.push(0x80 | ((packet.id >> 8) as u8 & 0x0F));
                    entry.push((packet.id & 0xFF) as u8);
                }
                None => {
                    entry.push(component.subchannel_id & 0x3F);
                }
            }

            if payload.len() + entry.len() > available {
                break;
            }
            payload.extend_from_slice(&entry);
            self.cursor += 1;
        }

        let written = write_fig0(buf, 8, pd, &payload);
        if written == 0 && !payload.is_empty() {
            return FillStatus {
                written: 0,
                complete: false,
            };
        }

        let mut complete = false;
        if self.cursor >= components.len() {
            self.cursor = 0;
            complete = true;
        }
        FillStatus { written, complete }
    }
}

// ---------------------------------------------------------------- FIG 0/9

/// Country, LTO and international table.
#[derive(Debug, Default)]
pub struct Fig0_9;

impl Fig0_9 {
    pub fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        let payload = [
            (ctx.ensemble.lto as u8) & 0x3F,
            ctx.ensemble.ecc,
            ctx.ensemble.international_table,
        ];
        let written = write_fig0(buf, 9, false, &payload);
        FillStatus {
            written,
            complete: written > 0,
        }
    }
}

// --------------------------------------------------------------- FIG 0/10

/// Date and time: MJD and UTC, long form with seconds.
#[derive(Debug)]
pub struct Fig0_10 {
    pub with_seconds: bool,
}

impl Default for Fig0_10 {
    fn default() -> Self {
        Fig0_10 { with_seconds: true }
    }
}

impl Fig0_10 {
    pub fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        let t = ctx.unix_time;
        let mjd = (40587 + t.div_euclid(86400)) as u32 & 0x1FFFF;
        let tod = t.rem_euclid(86400);
        let hours = (tod / 3600) as u32;
        let minutes = (tod / 60 % 60) as u32;
        let seconds = (tod % 60) as u32;

        let mut payload = Vec::with_capacity(6);
        // RFU(1) MJD(17) LSI(1) ConfInd(1) UTC flag(1) then the UTC field
        let head = (mjd << 14) | ((self.with_seconds as u32) << 11) | (hours << 6) | minutes;
        payload.extend_from_slice(&head.to_be_bytes());
        if self.with_seconds {
            // seconds(6) + milliseconds(10), milliseconds always 0
            payload.push((seconds << 2) as u8);
            payload.push(0);
        }

        let written = write_fig0(buf, 10, false, &payload);
        FillStatus {
            written,
            complete: written > 0,
        }
    }
}

// --------------------------------------------------------------- FIG 0/13

/// User application information.
#[derive(Debug, Default)]
pub struct Fig0_13 {
    cursor: usize,
}

impl Fig0_13 {
    pub fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        let ensemble = ctx.ensemble;
        fill_rotating(
            &mut self.cursor,
            &ensemble.components,
            13,
            false,
            buf,
            |component| {
                if component.user_applications.is_empty() {
                    return None;
                }
                let service = ensemble.get_service(component.service_id)?;
                let pd = !ensemble.service_is_programme(service);

                let mut entry = Vec::new();
                if pd {
                    entry.extend_from_slice(&component.service_id.to_be_bytes());
                } else {
                    entry.extend_from_slice(&(component.service_id as u16).to_be_bytes());
                }
                entry.push(
                    ((component.scids & 0x0F) << 4)
                        | (component.user_applications.len() as u8 & 0x0F),
                );
                for app in &component.user_applications {
                    entry.push((app.app_type >> 3) as u8);
                    entry.push(
                        (((app.app_type & 0x07) as u8) << 5) | (app.data.len() as u8 & 0x1F),
                    );
                    entry.extend_from_slice(&app.data);
                }
                Some(entry)
            },
        )
    }
}

// --------------------------------------------------------------- FIG 0/14

/// FEC scheme for packet mode sub-channels.
#[derive(Debug, Default)]
pub struct Fig0_14 {
    cursor: usize,
}

impl Fig0_14 {
    pub fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        let ensemble = ctx.ensemble;
        fill_rotating(
            &mut self.cursor,
            &ensemble.components,
            14,
            false,
            buf,
            |component| {
                let scheme = match component.fec_scheme? {
                    FecScheme::None => 0u8,
                    FecScheme::Rs => 1u8,
                };
                let subch = ensemble.get_subchannel(component.subchannel_id)?;
                if subch.ty != SubchannelType::Packet {
                    return None;
                }
                Some(vec![(subch.id << 2) | (scheme & 0x03)])
            },
        )
    }
}

// --------------------------------------------------------------- FIG 0/17

/// Programme type.
#[derive(Debug, Default)]
pub struct Fig0_17 {
    cursor: usize,
}

impl Fig0_17 {
    pub fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        let ensemble = ctx.ensemble;
        fill_rotating(
            &mut self.cursor,
            &ensemble.services,
            17,
            false,
            buf,
            |service| {
                if service.pty == 0 || !ensemble.service_is_programme(service) {
                    return None;
                }
                let sid = (service.id as u16).to_be_bytes();
                // S/D 0: static PTy; no language, no CC part
                Some(vec![sid[0], sid[1], 0x00, service.pty & 0x1F])
            },
        )
    }
}

// --------------------------------------------------------------- FIG 0/18

/// Announcement support.
#[derive(Debug, Default)]
pub struct Fig0_18 {
    cursor: usize,
}

impl Fig0_18 {
    pub fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        fill_rotating(
            &mut self.cursor,
            &ctx.ensemble.services,
            18,
            false,
            buf,
            |service| {
                let support = service.announcements.as_ref()?;
                let mut entry = Vec::with_capacity(5 + support.clusters.len());
                entry.extend_from_slice(&(service.id as u16).to_be_bytes());
                entry.extend_from_slice(&support.flags.to_be_bytes());
                entry.push(support.clusters.len() as u8 & 0x07);
                entry.extend_from_slice(&support.clusters);
                Some(entry)
            },
        )
    }
}

// --------------------------------------------------------------- FIG 0/19

/// Announcement switching. Transmitted at the fast rate while any
/// announcement is starting or stopping.
#[derive(Debug, Default)]
pub struct Fig0_19 {
    transitions: TransitionHandler<u8>,
}

impl Fig0_19 {
    pub fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        let clusters = &ctx.ensemble.clusters;
        self.transitions.update_state(
            ANNOUNCEMENT_TRANSITION_TIMEOUT,
            ctx.now,
            clusters.iter().map(|c| (&c.cluster_id, c.active)),
        );

        let mut payload = Vec::new();
        for cluster in clusters {
            let is_new = self.transitions.new.contains_key(&cluster.cluster_id);
            let announced = is_new
                || self.transitions.repeated.contains(&cluster.cluster_id)
                || self.transitions.disabled.contains_key(&cluster.cluster_id);
            if !announced {
                continue;
            }

            // A disabled cluster is announced with ASw zero so receivers
            // return to the main programme.
            let asw = if cluster.active { cluster.flags } else { 0 };

            payload.push(cluster.cluster_id);
            payload.extend_from_slice(&asw.to_be_bytes());
            payload.push(((is_new as u8) << 7) | (cluster.subchannel_id & 0x3F));
        }

        if payload.is_empty() {
            return FillStatus {
                written: 0,
                complete: true,
            };
        }

        let written = write_fig0(buf, 19, false, &payload);
        FillStatus {
            written,
            complete: written > 0,
        }
    }

    pub fn rate(&self) -> Rate {
        if self.transitions.has_transitions() {
            Rate::A
        } else {
            Rate::B
        }
    }
}

// --------------------------------------------------------------- FIG 0/21

/// Frequency information, R&M "DAB ensemble".
#[derive(Debug, Default)]
pub struct Fig0_21 {
    cursor: usize,
}

impl Fig0_21 {
    pub fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        fill_rotating(
            &mut self.cursor,
            &ctx.ensemble.frequency_information,
            21,
            false,
            buf,
            |fi| {
                // The 3-bit frequency list length counts bytes, so one FI
                // entry carries at most two 3-byte frequencies.
                let mut fi_list = Vec::new();
                for chunk in fi.frequencies.chunks(2) {
                    fi_list.extend_from_slice(&fi.other_ensemble_id.to_be_bytes());
                    fi_list.push(((fi.continuity as u8) << 3) | ((3 * chunk.len()) as u8 & 0x07));
                    for &freq_khz in chunk {
                        // R&M 0: frequency in 16 kHz units, 19 bits
                        let code = freq_khz / 16;
                        fi_list.push((code >> 16) as u8 & 0x07);
                        fi_list.push((code >> 8) as u8);
                        fi_list.push(code as u8);
                    }
                }
                if fi_list.is_empty() || fi_list.len() > 0x1F {
                    return None;
                }
                let mut entry = Vec::with_capacity(2 + fi_list.len());
                entry.push((fi.region_id >> 3) as u8);
                entry.push((((fi.region_id & 0x07) as u8) << 5) | (fi_list.len() as u8 & 0x1F));
                entry.extend_from_slice(&fi_list);
                Some(entry)
            },
        )
    }
}

// --------------------------------------------------------------- FIG 0/24

/// Other ensembles carrying our services.
#[derive(Debug, Default)]
pub struct Fig0_24 {
    cursor: usize,
}

impl Fig0_24 {
    pub fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        let ensemble = ctx.ensemble;
        fill_rotating(
            &mut self.cursor,
            &ensemble.other_ensemble_services,
            24,
            false,
            buf,
            |oe| {
                let mut entry = Vec::with_capacity(3 + 2 * oe.ensemble_ids.len());
                entry.extend_from_slice(&(oe.service_id as u16).to_be_bytes());
                entry.push(oe.ensemble_ids.len() as u8 & 0x0F);
                for eid in &oe.ensemble_ids {
                    entry.extend_from_slice(&eid.to_be_bytes());
                }
                Some(entry)
            },
        )
    }
}
