//! The multiplexer: pulls sub-channel payloads, schedules the FIC,
//! assembles one ETI frame per 24 ms tick and feeds the ETI sinks and the
//! EDI pipeline.

use std::time::Instant;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use log::{error, info, warn};
use serde_json::json;

use shared::clock::ClockTai;
use shared::dab::{Ensemble, Label};
use shared::edi::{self, tagitems, AfPacketiser, TagPacket};
use shared::eti::{self, MuxTime, SubchannelStream};
use shared::fic::{FigCarousel, FigContext};

use crate::config::MuxConfig;
use crate::inputs::{create_input, InputFacade};
use crate::outputs::OutputGroup;
use crate::remote::RemoteCommand;

struct SubchannelSlot {
    /// Index into `ensemble.subchannels`.
    index: usize,
    facade: InputFacade,
    buffer: Vec<u8>,
}

struct EdiOutput {
    sender: edi::Sender,
    alignment: usize,
    /// The `*ptr` tag never changes; assembled once.
    ptr_tag: Vec<u8>,
}

pub struct DabMultiplexer {
    ensemble: Ensemble,
    carousel: FigCarousel,
    time: MuxTime,
    current_frame: u64,
    nbframes: u64,
    slots: Vec<SubchannelSlot>,
    clock_tai: Option<ClockTai>,
    edi: Option<EdiOutput>,
    edi_conf: edi::Configuration,
    af_packetiser: AfPacketiser,
    tist_enabled: bool,
    tist_at_fct0: u32,
    tist_offset: i64,
    mnsc_increment_time: bool,
    tai_urls: Vec<String>,
    started_at: Instant,
}

impl DabMultiplexer {
    pub fn new(config: MuxConfig) -> Self {
        DabMultiplexer {
            ensemble: config.ensemble,
            carousel: FigCarousel::new(),
            time: MuxTime::init(0, 0, 0),
            current_frame: 0,
            nbframes: config.general.nbframes,
            slots: Vec::new(),
            clock_tai: None,
            edi: None,
            edi_conf: config.edi,
            af_packetiser: AfPacketiser::default(),
            tist_enabled: config.general.tist,
            tist_at_fct0: config.general.tist_at_fct0,
            tist_offset: config.general.tist_offset,
            mnsc_increment_time: config.general.mnsc_increment_time,
            tai_urls: config.tai_urls,
            started_at: Instant::now(),
        }
    }

    /// Validate the ensemble, open the inputs, set up the time base, the
    /// TAI clock and the EDI sender. Configuration problems are fatal
    /// here, before the first frame.
    pub fn prepare(&mut self) -> Result<()> {
        if let Err(errors) = self.ensemble.validate() {
            for e in &errors {
                error!("ensemble: {}", e);
            }
            bail!("invalid ensemble configuration ({} errors)", errors.len());
        }

        let mut indices: Vec<usize> = (0..self.ensemble.subchannels.len()).collect();
        indices.sort_by_key(|&i| self.ensemble.subchannels[i].id);

        self.slots.clear();
        for index in indices {
            let subch = &self.ensemble.subchannels[index];
            let input = create_input(&subch.input)
                .with_context(|| format!("sub-channel {}", subch.id))?;
            info!(
                "Sub-channel {}: {} kbit/s, {} CU at {}, input {}",
                subch.id,
                subch.bitrate,
                subch.size_cu(),
                subch.start_address,
                input.info()
            );
            self.slots.push(SubchannelSlot {
                index,
                facade: InputFacade::new(subch.id, input),
                buffer: vec![0u8; subch.frame_bytes()],
            });
        }

        let now_unix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.time = MuxTime::init(self.tist_at_fct0, self.tist_offset, now_unix);
        self.time.mnsc_increment_time = self.mnsc_increment_time;

        if self.edi_conf.enabled() {
            self.edi_conf.print();
            let sender = edi::Sender::new(&self.edi_conf)?;

            let clock = ClockTai::new(self.tai_urls.clone());
            // The first call blocks until a bulletin is found; without
            // one EDI timestamps would be wrong, so give up cleanly.
            let offset = clock
                .get_offset()
                .context("no TAI-UTC offset available, cannot start EDI output")?;
            info!("TAI-UTC offset is {}s", offset);
            self.clock_tai = Some(clock);

            self.edi = Some(EdiOutput {
                sender,
                alignment: self.edi_conf.tagpacket_alignment,
                ptr_tag: tagitems::TagStarPtr::new("DETI")
                    .expect("constant protocol")
                    .assemble(),
            });
        }

        info!(
            "Ensemble 0x{:04X} '{}': {} services, {} sub-channels, mode {}",
            self.ensemble.id,
            self.ensemble.label.text(),
            self.ensemble.services.len(),
            self.ensemble.subchannels.len(),
            self.ensemble.mode
        );
        Ok(())
    }

    pub fn frames_muxed(&self) -> u64 {
        self.current_frame
    }

    pub fn finished(&self) -> bool {
        self.nbframes > 0 && self.current_frame >= self.nbframes
    }

    /// Assemble and dispatch one frame. Drives one full data-path tick.
    pub fn mux_frame(&mut self, outputs: &mut OutputGroup) -> Result<()> {
        let tai_offset = match &self.clock_tai {
            Some(clock) => match clock.get_offset() {
                Ok(offset) => offset,
                Err(e) => {
                    // Only possible before the first bulletin; prepare()
                    // already made sure there is one.
                    bail!("TAI clock failed: {}", e);
                }
            },
            None => 0,
        };

        // (a) inputs
        for slot in &mut self.slots {
            slot.facade.read(&mut slot.buffer);
        }

        // (b) FIC
        let ctx = FigContext {
            ensemble: &self.ensemble,
            current_frame: self.current_frame,
            unix_time: self.time.edi_time(),
            now: Instant::now(),
        };
        let fic = self
            .carousel
            .write_fibs(&ctx, eti::fibs_per_frame(self.ensemble.mode));

        // (c) ETI frame
        let streams: Vec<SubchannelStream> = self
            .slots
            .iter()
            .map(|slot| {
                let subch = &self.ensemble.subchannels[slot.index];
                SubchannelStream {
                    id: subch.id,
                    start_address: subch.start_address,
                    tpl: subch.tpl(),
                    data: &slot.buffer,
                }
            })
            .collect();

        let tist = if self.tist_enabled {
            self.time.tist(tai_offset)
        } else {
            0xFFFFFFFF
        };
        let mnsc = self.time.mnsc(self.current_frame % 4);

        let frame = eti::build_frame(
            self.ensemble.mode,
            self.current_frame,
            &streams,
            &fic,
            mnsc,
            tist,
        )?;

        // (d) ETI sinks
        outputs.write(&frame);

        // (e) EDI pipeline
        if let Some(edi_out) = &mut self.edi {
            let mut tagpacket = TagPacket::new(edi_out.alignment);
            tagpacket.push(edi_out.ptr_tag.clone());

            let (utco, seconds) = self.time.edi_seconds(tai_offset);
            let deti = tagitems::TagDeti {
                atstf: self.tist_enabled,
                ficf: true,
                rfudf: false,
                dlfc: (self.current_frame % eti::DLFC_MODULO) as u32,
                stat: 0xFF,
                mid: if self.ensemble.mode == 4 {
                    0
                } else {
                    self.ensemble.mode
                },
                fp: (self.current_frame % 8) as u8,
                mnsc,
                utco,
                seconds,
                tsta: self.time.tsta(),
                fic: fic.clone(),
                rfud: 0,
            };
            tagpacket.push(deti.assemble());

            for (i, slot) in self.slots.iter().enumerate() {
                let subch = &self.ensemble.subchannels[slot.index];
                let est = tagitems::TagEstN {
                    id: (i + 1) as u8,
                    scid: subch.id,
                    sad: subch.start_address,
                    tpl: subch.tpl(),
                    mst: slot.buffer.clone(),
                };
                tagpacket.push(est.assemble()?);
            }

            tagpacket.push(
                tagitems::TagOdrVersion {
                    version: env!("CARGO_PKG_VERSION").to_owned(),
                    uptime_s: self.started_at.elapsed().as_secs() as u32,
                }
                .assemble(),
            );

            let af = self.af_packetiser.assemble(&tagpacket.assemble());
            edi_out.sender.write_af_packet(&Bytes::from(af));
        }

        self.current_frame += 1;
        self.time.increment_timestamp();
        Ok(())
    }

    /// Remote-control mutations, applied between frames only.
    pub fn apply_remote(&mut self, command: RemoteCommand) {
        match command {
            RemoteCommand::SetTaiOffset(offset) => match &self.clock_tai {
                Some(clock) => {
                    if let Err(e) = clock.set_parameter("tai_utc_offset", &offset.to_string()) {
                        warn!("remote: {}", e);
                    }
                }
                None => warn!("remote: TAI clock not active"),
            },
            RemoteCommand::SetTaiUrls(urls) => match &self.clock_tai {
                Some(clock) => {
                    if let Err(e) = clock.set_parameter("url", &urls) {
                        warn!("remote: {}", e);
                    }
                }
                None => warn!("remote: TAI clock not active"),
            },
            RemoteCommand::OverrideAfSeq(seq) => self.af_packetiser.override_seq(seq),
            RemoteCommand::OverridePftSeq(pseq) => {
                if let Some(edi_out) = &self.edi {
                    edi_out.sender.override_pft_sequence(pseq);
                }
            }
            RemoteCommand::SetServiceLabel {
                service_id,
                label,
                short,
            } => {
                let new_label = match Label::new(&label, short.as_deref()) {
                    Ok(l) => l,
                    Err(e) => {
                        warn!("remote: label rejected: {}", e);
                        return;
                    }
                };
                let Some(service) = self
                    .ensemble
                    .services
                    .iter_mut()
                    .find(|s| s.id == service_id)
                else {
                    warn!("remote: no service 0x{:04X}", service_id);
                    return;
                };
                let previous = std::mem::replace(&mut service.label, new_label);
                if let Err(errors) = self.ensemble.validate() {
                    for e in &errors {
                        warn!("remote: {}", e);
                    }
                    if let Some(service) = self
                        .ensemble
                        .services
                        .iter_mut()
                        .find(|s| s.id == service_id)
                    {
                        service.label = previous;
                    }
                }
            }
            RemoteCommand::SetAnnouncement { cluster_id, active } => {
                match self
                    .ensemble
                    .clusters
                    .iter_mut()
                    .find(|c| c.cluster_id == cluster_id)
                {
                    Some(cluster) => cluster.active = active,
                    None => warn!("remote: no announcement cluster {}", cluster_id),
                }
            }
            RemoteCommand::GetValues(reply) => {
                let _ = reply.try_send(self.get_all_values());
            }
        }
    }

    /// Statistics snapshot for the external monitoring surface.
    pub fn get_all_values(&self) -> serde_json::Value {
        json!({
            "frames": self.current_frame,
            "uptime_s": self.started_at.elapsed().as_secs(),
            "tai": self.clock_tai.as_ref().map(|c| c.get_all_values()),
            "edi_destinations": self.edi.as_ref()
                .map(|e| e.sender.destinations_info())
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFile;

    fn test_config() -> MuxConfig {
        let yaml = r#"
general:
  nbframes: 10
ensemble:
  id: "0xABCD"
  ecc: "0xE1"
  label: "Test"
services:
  - id: "0x1000"
    label: "Test"
subchannels:
  - id: 1
    type: dab-plus-audio
    input: "silence://"
    bitrate: 128
    protection: "EEP_3A"
components:
  - service: "0x1000"
    subchannel: 1
"#;
        let config: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        config.build().unwrap()
    }

    #[test]
    fn frames_until_limit() {
        let mut mux = DabMultiplexer::new(test_config());
        mux.prepare().unwrap();

        let mut outputs = OutputGroup::from_uris(&[]).unwrap();
        while !mux.finished() {
            mux.mux_frame(&mut outputs).unwrap();
        }
        assert_eq!(mux.frames_muxed(), 10);
    }

    #[test]
    fn remote_label_update_validated() {
        let mut mux = DabMultiplexer::new(test_config());
        mux.prepare().unwrap();

        mux.apply_remote(RemoteCommand::SetServiceLabel {
            service_id: 0x1000,
            label: "New Name".to_owned(),
            short: Some("New".to_owned()),
        });
        assert_eq!(mux.ensemble.services[0].label.text(), "New Name");

        // a label whose short variant is not a subsequence is rejected
        mux.apply_remote(RemoteCommand::SetServiceLabel {
            service_id: 0x1000,
            label: "Other".to_owned(),
            short: Some("zzz".to_owned()),
        });
        assert_eq!(mux.ensemble.services[0].label.text(), "New Name");
    }

    #[test]
    fn remote_announcement_switch() {
        let mut config = test_config();
        config.ensemble.clusters.push(shared::dab::AnnouncementCluster {
            cluster_id: 1,
            flags: 0x0001,
            subchannel_id: 1,
            active: false,
        });

        let mut mux = DabMultiplexer::new(config);
        mux.prepare().unwrap();

        mux.apply_remote(RemoteCommand::SetAnnouncement {
            cluster_id: 1,
            active: true,
        });
        assert!(mux.ensemble.clusters[0].active);
    }
}
