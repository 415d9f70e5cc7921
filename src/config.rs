//! YAML ensemble description. This is the configuration collaborator of
//! the multiplex engine: it only builds the in-memory model and the output
//! settings, everything else consumes the model.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use shared::dab::{
    AnnouncementCluster, AnnouncementSupport, Component, Ensemble, FecScheme, FrequencyInformation,
    InputDescriptor, Label, LinkageSet, OtherEnsembleService, PacketComponent, Protection,
    Service, Subchannel, SubchannelType, UserApplication,
};
use shared::dab::tables::UEP_TABLE;
use shared::edi;

fn parse_number(value: &serde_yaml::Value, what: &str) -> Result<u64> {
    match value {
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| anyhow!("{}: not an unsigned integer", what)),
        serde_yaml::Value::String(s) => {
            let s = s.trim();
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16).with_context(|| format!("{}: bad hex '{}'", what, s))
            } else {
                s.parse().with_context(|| format!("{}: bad number '{}'", what, s))
            }
        }
        other => bail!("{}: expected number, got {:?}", what, other),
    }
}

/// Ids may be written as numbers or as "0x..." strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct Id(serde_yaml::Value);

impl Id {
    fn as_u16(&self, what: &str) -> Result<u16> {
        Ok(parse_number(&self.0, what)? as u16)
    }

    fn as_u32(&self, what: &str) -> Result<u32> {
        Ok(parse_number(&self.0, what)? as u32)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    #[serde(default = "default_mode")]
    pub mode: u8,
    /// Stop after this many frames; 0 runs forever.
    #[serde(default)]
    pub nbframes: u64,
    #[serde(default = "default_true")]
    pub tist: bool,
    /// TIST at frame count zero, microseconds.
    #[serde(default)]
    pub tist_at_fct0: u32,
    /// Shift of the EDI timestamps, seconds.
    #[serde(default)]
    pub tist_offset: i64,
    /// Derive MNSC from an independent second counter (compatibility with
    /// receivers that decode MNSC time).
    #[serde(default)]
    pub mnsc_increment_time: bool,
}

fn default_mode() -> u8 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnsembleConfig {
    pub id: Id,
    pub ecc: Id,
    pub label: String,
    #[serde(default)]
    pub shortlabel: Option<String>,
    #[serde(default)]
    pub extended_label: Option<String>,
    #[serde(default)]
    pub local_time_offset: i8,
    #[serde(default = "default_international_table")]
    pub international_table: u8,
}

fn default_international_table() -> u8 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub id: Id,
    pub label: String,
    #[serde(default)]
    pub shortlabel: Option<String>,
    #[serde(default)]
    pub extended_label: Option<String>,
    #[serde(default)]
    pub pty: u8,
    #[serde(default)]
    pub language: u8,
    #[serde(default)]
    pub program: Option<bool>,
    #[serde(default)]
    pub announcements: Option<AnnouncementsConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnnouncementsConfig {
    pub flags: u16,
    #[serde(default)]
    pub clusters: Vec<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubchannelConfig {
    pub id: u8,
    #[serde(rename = "type")]
    pub ty: SubchannelType,
    /// `proto://name`: file, fifo, udp or silence.
    pub input: String,
    pub bitrate: u16,
    /// "EEP_3A" style or "UEP_3" (protection level, resolved through the
    /// sub-channel size table together with the bitrate).
    pub protection: String,
    #[serde(default)]
    pub start_address: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PacketConfig {
    pub id: u16,
    #[serde(default)]
    pub address: u16,
    #[serde(default)]
    pub datagroup: bool,
    #[serde(default)]
    pub dscty: u8,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserAppConfig {
    pub apptype: u16,
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentConfig {
    pub service: Id,
    pub subchannel: u8,
    #[serde(default)]
    pub scids: Option<u8>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub shortlabel: Option<String>,
    #[serde(rename = "type", default)]
    pub ty: u8,
    #[serde(default)]
    pub packet: Option<PacketConfig>,
    #[serde(default)]
    pub fec_scheme: Option<FecScheme>,
    #[serde(default)]
    pub user_applications: Vec<UserAppConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PftConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_fec")]
    pub fec: u32,
    #[serde(default = "default_chunk_len")]
    pub chunk_len: usize,
    #[serde(default = "default_spreading")]
    pub fragment_spreading_factor: f64,
}

impl Default for PftConfig {
    fn default() -> Self {
        PftConfig {
            enable: false,
            fec: default_fec(),
            chunk_len: default_chunk_len(),
            fragment_spreading_factor: default_spreading(),
        }
    }
}

fn default_fec() -> u32 {
    2
}

fn default_chunk_len() -> usize {
    207
}

fn default_spreading() -> f64 {
    0.95
}

#[derive(Debug, Deserialize)]
#[serde(tag = "protocol", rename_all = "kebab-case")]
pub enum EdiTransportConfig {
    Udp {
        destination: String,
        port: u16,
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        source_port: u16,
        #[serde(default = "default_ttl")]
        ttl: u32,
    },
    TcpServer {
        listen_port: u16,
        #[serde(default = "default_queue")]
        max_frames_queued: usize,
        #[serde(default)]
        preroll_buffers: usize,
    },
    TcpClient {
        destination: String,
        port: u16,
        #[serde(default = "default_queue")]
        max_frames_queued: usize,
    },
}

fn default_ttl() -> u32 {
    10
}

fn default_queue() -> usize {
    500
}

#[derive(Debug, Deserialize)]
pub struct EdiDestinationConfig {
    #[serde(flatten)]
    pub transport: EdiTransportConfig,
    #[serde(default)]
    pub pft: PftConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdiConfig {
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_alignment")]
    pub tagpacket_alignment: usize,
    #[serde(default)]
    pub destinations: Vec<EdiDestinationConfig>,
}

fn default_alignment() -> usize {
    8
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TaiConfig {
    #[serde(default)]
    pub urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub general: GeneralConfig,
    pub ensemble: EnsembleConfig,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub subchannels: Vec<SubchannelConfig>,
    #[serde(default)]
    pub components: Vec<ComponentConfig>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub edi: Option<EdiConfig>,
    #[serde(default)]
    pub tai_clock: TaiConfig,
}

/// Everything the daemon needs, built from the configuration file.
pub struct MuxConfig {
    pub ensemble: Ensemble,
    pub general: GeneralConfig,
    pub outputs: Vec<String>,
    pub edi: edi::Configuration,
    pub tai_urls: Vec<String>,
}

/// "EEP_3A" / "EEP-2B" or "UEP_4"; UEP protection levels are resolved
/// through the sub-channel size table together with the bitrate.
pub fn parse_protection(spec: &str, bitrate: u16) -> Result<Protection> {
    let normalized = spec.to_ascii_uppercase().replace(['-', ' '], "_");

    if let Some(rest) = normalized.strip_prefix("EEP_") {
        let rest = rest.replace('_', "");
        let mut chars = rest.chars();
        let level_digit = chars
            .next()
            .and_then(|c| c.to_digit(10))
            .ok_or_else(|| anyhow!("bad EEP protection '{}'", spec))?;
        let profile = chars.next().ok_or_else(|| anyhow!("bad EEP protection '{}'", spec))?;
        if !(1..=4).contains(&level_digit) {
            bail!("EEP protection level {} out of range 1..=4", level_digit);
        }
        let option = match profile {
            'A' => 0,
            'B' => 1,
            other => bail!("bad EEP profile '{}'", other),
        };
        return Ok(Protection::Eep {
            option,
            level: (level_digit - 1) as u8,
        });
    }

    if let Some(rest) = normalized.strip_prefix("UEP_") {
        let level: u8 = rest
            .parse()
            .with_context(|| format!("bad UEP protection '{}'", spec))?;
        let index = UEP_TABLE
            .iter()
            .position(|e| e.bitrate == bitrate && e.protection_level == level)
            .ok_or_else(|| {
                anyhow!(
                    "no UEP table entry for bitrate {} at protection level {}",
                    bitrate,
                    level
                )
            })?;
        return Ok(Protection::Uep {
            table_switch: 0,
            table_index: index as u8,
        });
    }

    bail!("cannot parse protection '{}'", spec)
}

fn build_label(text: &str, short: Option<&str>, extended: Option<&str>) -> Result<Label> {
    let mut label = Label::new(text, short)?;
    if let Some(long) = extended {
        label.set_long_label(long)?;
    }
    Ok(label)
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("parsing configuration {}", path.display()))
    }

    pub fn build(self) -> Result<MuxConfig> {
        let mut subchannels = Vec::with_capacity(self.subchannels.len());
        let mut next_start: u16 = 0;

        for sc in &self.subchannels {
            let protection = parse_protection(&sc.protection, sc.bitrate)?;
            let (proto, name) = sc
                .input
                .split_once("://")
                .ok_or_else(|| anyhow!("subchannel {}: input is not proto://name", sc.id))?;

            let start_address = sc.start_address.unwrap_or(next_start);
            let subchannel = Subchannel {
                id: sc.id,
                ty: sc.ty,
                start_address,
                bitrate: sc.bitrate,
                protection,
                input: InputDescriptor {
                    proto: proto.to_owned(),
                    name: name.to_owned(),
                },
            };
            next_start = start_address + subchannel.size_cu();
            subchannels.push(subchannel);
        }

        let mut services = Vec::with_capacity(self.services.len());
        for sv in &self.services {
            let id = sv.id.as_u32("service id")?;
            services.push(Service {
                id,
                pty: sv.pty,
                language: sv.language,
                program: sv.program.unwrap_or(id <= 0xFFFF),
                label: build_label(
                    &sv.label,
                    sv.shortlabel.as_deref(),
                    sv.extended_label.as_deref(),
                )?,
                announcements: sv.announcements.as_ref().map(|a| AnnouncementSupport {
                    flags: a.flags,
                    clusters: a.clusters.clone(),
                }),
            });
        }

        let mut components = Vec::with_capacity(self.components.len());
        let mut scids_per_service: std::collections::BTreeMap<u32, u8> = Default::default();
        for cp in &self.components {
            let service_id = cp.service.as_u32("component service id")?;
            let scids = match cp.scids {
                Some(s) => s,
                None => {
                    let next = scids_per_service.entry(service_id).or_insert(0);
                    let s = *next;
                    *next += 1;
                    s
                }
            };
            components.push(Component {
                service_id,
                subchannel_id: cp.subchannel,
                scids,
                ty: cp.ty,
                label: match &cp.label {
                    Some(text) => build_label(text, cp.shortlabel.as_deref(), None)?,
                    None => Label::default(),
                },
                packet: cp.packet.as_ref().map(|p| PacketComponent {
                    id: p.id,
                    address: p.address,
                    dscty: p.dscty,
                    datagroup: p.datagroup,
                }),
                fec_scheme: cp.fec_scheme,
                user_applications: cp
                    .user_applications
                    .iter()
                    .map(|ua| UserApplication {
                        app_type: ua.apptype,
                        data: ua.data.clone(),
                    })
                    .collect(),
            });
        }

        let ensemble = Ensemble {
            id: self.ensemble.id.as_u16("ensemble id")?,
            ecc: self.ensemble.ecc.as_u16("ensemble ecc")? as u8,
            mode: self.general.mode,
            lto: self.ensemble.local_time_offset,
            international_table: self.ensemble.international_table,
            label: build_label(
                &self.ensemble.label,
                self.ensemble.shortlabel.as_deref(),
                self.ensemble.extended_label.as_deref(),
            )?,
            services,
            components,
            subchannels,
            clusters: Vec::<AnnouncementCluster>::new(),
            linkage_sets: Vec::<LinkageSet>::new(),
            frequency_information: Vec::<FrequencyInformation>::new(),
            other_ensemble_services: Vec::<OtherEnsembleService>::new(),
            reconfig_counter: 0,
        };

        let edi = match self.edi {
            Some(conf) => {
                let mut destinations = Vec::with_capacity(conf.destinations.len());
                for dest in conf.destinations {
                    let (destination, pft_dest_port) = match dest.transport {
                        EdiTransportConfig::Udp {
                            destination,
                            port,
                            source,
                            source_port,
                            ttl,
                        } => (
                            edi::Destination::Udp(edi::UdpDestination {
                                dest_addr: destination,
                                dest_port: port,
                                source_addr: source,
                                source_port,
                                ttl,
                            }),
                            port,
                        ),
                        EdiTransportConfig::TcpServer {
                            listen_port,
                            max_frames_queued,
                            preroll_buffers,
                        } => (
                            edi::Destination::TcpServer(edi::TcpServerDestination {
                                listen_port,
                                max_frames_queued,
                                preroll_buffers,
                            }),
                            0,
                        ),
                        EdiTransportConfig::TcpClient {
                            destination,
                            port,
                            max_frames_queued,
                        } => (
                            edi::Destination::TcpClient(edi::TcpClientDestination {
                                dest_addr: destination,
                                dest_port: port,
                                max_frames_queued,
                            }),
                            port,
                        ),
                    };

                    destinations.push(edi::DestinationConfig {
                        destination,
                        pft: edi::PftSettings {
                            enable_pft: dest.pft.enable,
                            fec: dest.pft.fec,
                            chunk_len: dest.pft.chunk_len,
                            fragment_spreading_factor: dest.pft.fragment_spreading_factor,
                            dest_port: pft_dest_port,
                            verbose: conf.verbose,
                        },
                    });
                }

                edi::Configuration {
                    verbose: conf.verbose,
                    tagpacket_alignment: conf.tagpacket_alignment,
                    destinations,
                }
            }
            None => edi::Configuration::default(),
        };

        Ok(MuxConfig {
            ensemble,
            general: self.general,
            outputs: self.outputs,
            edi,
            tai_urls: self.tai_clock.urls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
general:
  mode: 1
  nbframes: 250
ensemble:
  id: "0xABCD"
  ecc: "0xE1"
  label: "Test Ensemble"
  shortlabel: "Test"
services:
  - id: "0x1000"
    label: "Service One"
    shortlabel: "One"
subchannels:
  - id: 1
    type: dab-plus-audio
    input: "silence://"
    bitrate: 128
    protection: "EEP_3A"
components:
  - service: "0x1000"
    subchannel: 1
outputs:
  - "file:///tmp/test.eti?type=raw"
edi:
  destinations:
    - protocol: udp
      destination: "232.20.10.1"
      port: 12000
      source: "192.168.1.1"
      ttl: 1
      pft:
        enable: true
        fec: 2
"#;

    #[test]
    fn sample_config_builds() {
        let config: ConfigFile = serde_yaml::from_str(SAMPLE).unwrap();
        let mux = config.build().unwrap();

        assert_eq!(mux.ensemble.id, 0xABCD);
        assert_eq!(mux.ensemble.ecc, 0xE1);
        assert_eq!(mux.ensemble.services.len(), 1);
        assert_eq!(mux.ensemble.subchannels[0].size_cu(), 96);
        assert_eq!(mux.general.nbframes, 250);
        assert!(mux.ensemble.validate().is_ok());

        assert_eq!(mux.edi.destinations.len(), 1);
        let dest = &mux.edi.destinations[0];
        assert!(dest.pft.enable_pft);
        assert_eq!(dest.pft.dest_port, 12000);
        match &dest.destination {
            edi::Destination::Udp(udp) => {
                assert_eq!(udp.dest_addr, "232.20.10.1");
                assert_eq!(udp.ttl, 1);
            }
            other => panic!("unexpected destination {:?}", other),
        }
    }

    #[test]
    fn start_addresses_auto_allocated() {
        let yaml = r#"
general: {}
ensemble:
  id: 1
  ecc: 0
  label: "E"
subchannels:
  - { id: 1, type: dab-plus-audio, input: "silence://", bitrate: 128, protection: "EEP_3A" }
  - { id: 2, type: dab-audio, input: "silence://", bitrate: 128, protection: "UEP_3" }
"#;
        let config: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        let mux = config.build().unwrap();
        assert_eq!(mux.ensemble.subchannels[0].start_address, 0);
        // EEP 3-A at 128 kbit/s is 96 CU
        assert_eq!(mux.ensemble.subchannels[1].start_address, 96);
        // UEP table: 128 kbit/s at PL3 is 96 CU
        assert_eq!(mux.ensemble.subchannels[1].size_cu(), 96);
    }

    #[test]
    fn protection_strings() {
        assert_eq!(
            parse_protection("EEP_3A", 128).unwrap(),
            Protection::Eep { option: 0, level: 2 }
        );
        assert_eq!(
            parse_protection("eep-1b", 32).unwrap(),
            Protection::Eep { option: 1, level: 0 }
        );
        assert!(matches!(
            parse_protection("UEP_5", 32).unwrap(),
            Protection::Uep { table_index: 0, .. }
        ));
        assert!(parse_protection("EEP_5A", 128).is_err());
        assert!(parse_protection("UEP_1", 24).is_err());
        assert!(parse_protection("garbage", 128).is_err());
    }
}
