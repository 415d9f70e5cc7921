//! In-memory description of the ensemble: services, components and
//! sub-channels, with the derived sizes and field encodings the framer and
//! the FIG producers need.

pub mod charset;
pub mod label;
pub mod tables;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use label::{Label, LabelError};

/// Capacity Units available in the MSC of one frame.
pub const CAPACITY_UNITS_PER_FRAME: u16 = 864;

/// Maximum sub-channel id (6-bit field).
pub const MAX_SUBCHANNEL_ID: u8 = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubchannelType {
    DabAudio,
    DabPlusAudio,
    Packet,
    DataStream,
}

impl SubchannelType {
    pub fn is_audio(self) -> bool {
        matches!(self, SubchannelType::DabAudio | SubchannelType::DabPlusAudio)
    }
}

/// Error protection of a sub-channel, either short-form UEP via the
/// Sub-channel Size table or long-form EEP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protection {
    Uep {
        table_switch: u8,
        table_index: u8,
    },
    /// `option` 0 is profile A, 1 is profile B; `level` 0..=3 maps to the
    /// advertised protection level 1-A..4-A resp. 1-B..4-B.
    Eep {
        option: u8,
        level: u8,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtectionError {
    #[error("UEP table index {0} out of range")]
    BadTableIndex(u8),

    #[error("EEP option {0} is not 0 or 1")]
    BadOption(u8),

    #[error("EEP level {0} out of range 0..=3")]
    BadLevel(u8),
}

impl Protection {
    pub fn validate(&self) -> Result<(), ProtectionError> {
        match *self {
            Protection::Uep { table_index, .. } => {
                if table_index as usize >= tables::UEP_TABLE.len() {
                    return Err(ProtectionError::BadTableIndex(table_index));
                }
            }
            Protection::Eep { option, level } => {
                if option > 1 {
                    return Err(ProtectionError::BadOption(option));
                }
                if level > 3 {
                    return Err(ProtectionError::BadLevel(level));
                }
            }
        }
        Ok(())
    }

    /// Sub-channel size in Capacity Units for the given bit rate.
    pub fn size_cu(&self, bitrate: u16) -> u16 {
        match *self {
            Protection::Uep { table_index, .. } => tables::UEP_TABLE[table_index as usize].size_cu,
            Protection::Eep { option: 0, level } => {
                bitrate * tables::EEP_A_SIZE_FACTORS[level as usize] / 8
            }
            Protection::Eep { level, .. } => {
                bitrate * tables::EEP_B_SIZE_FACTORS[level as usize] / 32
            }
        }
    }

    /// The 6-bit TPL field of the ETI STC and the EDI ESTn SSTC.
    pub fn tpl(&self) -> u8 {
        match *self {
            Protection::Uep { table_index, .. } => {
                0x10 | ((tables::UEP_TABLE[table_index as usize].protection_level - 1) & 0x07)
            }
            Protection::Eep { option, level } => 0x08 | ((option & 0x07) << 2) | (level & 0x03),
        }
    }
}

/// Where a sub-channel gets its payload from, `proto://name` in the
/// configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDescriptor {
    pub proto: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subchannel {
    /// 6-bit sub-channel id.
    pub id: u8,
    #[serde(rename = "type")]
    pub ty: SubchannelType,
    /// Start address in Capacity Units.
    pub start_address: u16,
    /// kbit/s, multiple of 8.
    pub bitrate: u16,
    pub protection: Protection,
    pub input: InputDescriptor,
}

impl Subchannel {
    pub fn size_cu(&self) -> u16 {
        self.protection.size_cu(self.bitrate)
    }

    pub fn tpl(&self) -> u8 {
        self.protection.tpl()
    }

    /// Stream length in 64-bit words, as carried in the STC.
    pub fn stl(&self) -> u16 {
        // One CU is 64 bits
        self.size_cu()
    }

    /// Payload bytes per 24 ms frame.
    pub fn frame_bytes(&self) -> usize {
        self.stl() as usize * 8
    }
}

/// FEC scheme for packet mode sub-channels (FIG 0/14).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FecScheme {
    None,
    Rs,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacketComponent {
    /// 12-bit Service Component Id.
    pub id: u16,
    /// 10-bit packet address.
    pub address: u16,
    /// User application type carried in FIG 0/3 DSCTy position.
    pub dscty: u8,
    pub datagroup: bool,
}

/// A user application announced in FIG 0/13.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserApplication {
    /// 11-bit user application type.
    pub app_type: u16,
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub service_id: u32,
    pub subchannel_id: u8,
    /// 4-bit SCIdS.
    pub scids: u8,
    /// ASCTy/DSCTy, depending on the sub-channel type. For audio
    /// sub-channels this is derived and may be left 0 in the configuration.
    #[serde(default)]
    pub ty: u8,
    #[serde(default)]
    pub label: Label,
    #[serde(default)]
    pub packet: Option<PacketComponent>,
    #[serde(default)]
    pub fec_scheme: Option<FecScheme>,
    #[serde(default)]
    pub user_applications: Vec<UserApplication>,
}

/// Announcement support of a service (FIG 0/18).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnnouncementSupport {
    /// ASu bitmap.
    pub flags: u16,
    pub clusters: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    /// 16-bit for programme services, 32-bit for data services.
    pub id: u32,
    #[serde(default)]
    pub pty: u8,
    #[serde(default)]
    pub language: u8,
    /// Programme (audio) service flag; data services carry 32-bit SIds.
    pub program: bool,
    pub label: Label,
    #[serde(default)]
    pub announcements: Option<AnnouncementSupport>,
}

/// An announcement cluster that can be switched on and off at run time
/// (FIG 0/19).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnouncementCluster {
    pub cluster_id: u8,
    /// ASw bitmap transmitted while the announcement is active.
    pub flags: u16,
    pub subchannel_id: u8,
    #[serde(default)]
    pub active: bool,
}

/// Service linking information (FIG 0/6). Only DAB SId lists are carried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkageSet {
    /// 12-bit Linkage Set Number.
    pub lsn: u16,
    pub active: bool,
    pub hard: bool,
    pub international: bool,
    pub ids: Vec<u16>,
}

/// One frequency block of FIG 0/21, R&M "DAB ensemble".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrequencyInformation {
    /// 16-bit EId of the other ensemble.
    pub other_ensemble_id: u16,
    /// 11-bit region id.
    pub region_id: u16,
    pub continuity: bool,
    /// Carrier frequencies in kHz.
    pub frequencies: Vec<u32>,
}

/// Service carried in another ensemble (FIG 0/24).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtherEnsembleService {
    pub service_id: u32,
    pub ensemble_ids: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ensemble {
    /// 16-bit EId.
    pub id: u16,
    pub ecc: u8,
    /// Transmission mode 1..=4.
    pub mode: u8,
    /// Local time offset in half hours.
    #[serde(default)]
    pub lto: i8,
    /// International table id for FIG 0/9 (1 selects the PTy table of
    /// TS 101 756).
    #[serde(default = "default_international_table")]
    pub international_table: u8,
    pub label: Label,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(default)]
    pub subchannels: Vec<Subchannel>,
    #[serde(default)]
    pub clusters: Vec<AnnouncementCluster>,
    #[serde(default)]
    pub linkage_sets: Vec<LinkageSet>,
    #[serde(default)]
    pub frequency_information: Vec<FrequencyInformation>,
    #[serde(default)]
    pub other_ensemble_services: Vec<OtherEnsembleService>,
    /// Reconfiguration counter announced in FIG 0/7.
    #[serde(default)]
    pub reconfig_counter: u16,
}

fn default_international_table() -> u8 {
    1
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("duplicate sub-channel id {0}")]
    DuplicateSubchannelId(u8),

    #[error("sub-channel id {0} exceeds 63")]
    SubchannelIdRange(u8),

    #[error("sub-channel {0}: bitrate {1} is not a multiple of 8")]
    BadBitrate(u8, u16),

    #[error("sub-channel {0}: {1}")]
    BadProtection(u8, ProtectionError),

    #[error("sub-channels {0} and {1} overlap in CU range")]
    CuOverlap(u8, u8),

    #[error("sub-channel {id} ends at CU {end}, past the {max} available")]
    CuRange { id: u8, end: u32, max: u16 },

    #[error("duplicate service id 0x{0:04X}")]
    DuplicateServiceId(u32),

    #[error("programme service 0x{0:X} needs a 16-bit SId")]
    ProgrammeSidRange(u32),

    #[error("component of service 0x{0:04X} references unknown sub-channel {1}")]
    DanglingSubchannel(u32, u8),

    #[error("component of service 0x{0:04X} references unknown service")]
    DanglingService(u32),

    #[error("packet component of service 0x{0:04X} is not on a packet sub-channel")]
    PacketComponentType(u32),

    #[error("service 0x{sid:04X}: {err}")]
    Label { sid: u32, err: LabelError },

    #[error("ensemble label: {0}")]
    EnsembleLabel(LabelError),
}

impl Ensemble {
    pub fn get_subchannel(&self, id: u8) -> Option<&Subchannel> {
        self.subchannels.iter().find(|s| s.id == id)
    }

    pub fn get_service(&self, id: u32) -> Option<&Service> {
        self.services.iter().find(|s| s.id == id)
    }

    /// Components of one service, in declaration order.
    pub fn components_of(&self, service_id: u32) -> impl Iterator<Item = &Component> {
        self.components
            .iter()
            .filter(move |c| c.service_id == service_id)
    }

    /// The primary component is the first one declared for the service.
    pub fn is_primary(&self, component: &Component) -> bool {
        self.components_of(component.service_id)
            .next()
            .map(|first| std::ptr::eq(first, component))
            .unwrap_or(false)
    }

    /// Service type (audio or data) resolved through the primary
    /// component's sub-channel.
    pub fn service_type(&self, service: &Service) -> Option<SubchannelType> {
        let component = self.components_of(service.id).next()?;
        self.get_subchannel(component.subchannel_id).map(|s| s.ty)
    }

    pub fn service_is_programme(&self, service: &Service) -> bool {
        self.service_type(service)
            .map(|t| t.is_audio())
            .unwrap_or(service.program)
    }

    /// Consistency check run at startup and after each remote-control
    /// mutation.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        for (i, subch) in self.subchannels.iter().enumerate() {
            if subch.id > MAX_SUBCHANNEL_ID {
                errors.push(ValidationError::SubchannelIdRange(subch.id));
            }
            if self.subchannels[..i].iter().any(|s| s.id == subch.id) {
                errors.push(ValidationError::DuplicateSubchannelId(subch.id));
            }
            if subch.bitrate == 0 || subch.bitrate % 8 != 0 {
                errors.push(ValidationError::BadBitrate(subch.id, subch.bitrate));
            }
            if let Err(e) = subch.protection.validate() {
                errors.push(ValidationError::BadProtection(subch.id, e));
                continue;
            }

            let start = subch.start_address as u32;
            let end = start + subch.size_cu() as u32;
            if end > CAPACITY_UNITS_PER_FRAME as u32 {
                errors.push(ValidationError::CuRange {
                    id: subch.id,
                    end,
                    max: CAPACITY_UNITS_PER_FRAME,
                });
            }
            for other in &self.subchannels[..i] {
                if other.protection.validate().is_err() {
                    continue;
                }
                let ostart = other.start_address as u32;
                let oend = ostart + other.size_cu() as u32;
                if start < oend && ostart < end {
                    errors.push(ValidationError::CuOverlap(other.id, subch.id));
                }
            }
        }

        if let Err(e) = self.label.validate() {
            errors.push(ValidationError::EnsembleLabel(e));
        }

        for (i, service) in self.services.iter().enumerate() {
            if self.services[..i].iter().any(|s| s.id == service.id) {
                errors.push(ValidationError::DuplicateServiceId(service.id));
            }
            if service.program && service.id > 0xFFFF {
                errors.push(ValidationError::ProgrammeSidRange(service.id));
            }
            if let Err(err) = service.label.validate() {
                errors.push(ValidationError::Label {
                    sid: service.id,
                    err,
                });
            }
        }

        for component in &self.components {
            if self.get_service(component.service_id).is_none() {
                errors.push(ValidationError::DanglingService(component.service_id));
            }
            match self.get_subchannel(component.subchannel_id) {
                None => errors.push(ValidationError::DanglingSubchannel(
                    component.service_id,
                    component.subchannel_id,
                )),
                Some(subch) => {
                    if component.packet.is_some() && subch.ty != SubchannelType::Packet {
                        errors.push(ValidationError::PacketComponentType(component.service_id));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subch(id: u8, start: u16, bitrate: u16) -> Subchannel {
        Subchannel {
            id,
            ty: SubchannelType::DabPlusAudio,
            start_address: start,
            bitrate,
            protection: Protection::Eep { option: 0, level: 2 },
            input: InputDescriptor::default(),
        }
    }

    fn minimal_ensemble() -> Ensemble {
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
                label: Label::new("Service One", Some("One")).unwrap(),
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
            subchannels: vec![subch(1, 0, 128)],
            clusters: Vec::new(),
            linkage_sets: Vec::new(),
            frequency_information: Vec::new(),
            other_ensemble_services: Vec::new(),
            reconfig_counter: 0,
        }
    }

    #[test]
    fn eep_3a_sizes() {
        // 128 kbit/s at EEP 3-A occupies 96 CU
        let s = subch(1, 0, 128);
        assert_eq!(s.size_cu(), 96);
        assert_eq!(s.frame_bytes(), 96 * 8);
        assert_eq!(s.tpl(), 0x0A);
    }

    #[test]
    fn uep_sizes_from_table() {
        let s = Subchannel {
            protection: Protection::Uep {
                table_switch: 0,
                table_index: 33,
            },
            ty: SubchannelType::DabAudio,
            ..subch(2, 0, 128)
        };
        assert_eq!(s.size_cu(), 64);
        // table index 33 is protection level 5, TPL 0b010100
        assert_eq!(s.tpl(), 0x14);
    }

    #[test]
    fn valid_ensemble_passes() {
        assert!(minimal_ensemble().validate().is_ok());
    }

    #[test]
    fn cu_overlap_detected() {
        let mut e = minimal_ensemble();
        e.subchannels.push(subch(2, 95, 64));
        let errors = e.validate().unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::CuOverlap(1, 2))));
    }

    #[test]
    fn cu_range_checked() {
        let mut e = minimal_ensemble();
        e.subchannels[0].start_address = 800;
        let errors = e.validate().unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::CuRange { id: 1, .. })));
    }

    #[test]
    fn dangling_subchannel_detected() {
        let mut e = minimal_ensemble();
        e.components[0].subchannel_id = 9;
        let errors = e.validate().unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::DanglingSubchannel(0x1000, 9))));
    }

    #[test]
    fn service_type_resolved_via_primary_component() {
        let e = minimal_ensemble();
        let service = &e.services[0];
        assert_eq!(e.service_type(service), Some(SubchannelType::DabPlusAudio));
        assert!(e.service_is_programme(service));
    }
}
