//! PFT: Protection, Fragmentation and Transport layer of ETSI TS 102 821.
//!
//! An AF packet is cut into chunks of at most 207 bytes, each chunk gets 48
//! Reed-Solomon parity bytes, and the resulting RS block is spread
//! column-wise over `num_fragments` PF packets so that any
//! `num_fragments - fec` received fragments suffice to recover the AF
//! packet.

use thiserror::Error;

use crate::utils::{calc_crc16_ccitt, ceil_div};

use super::rs::{ReedSolomon, RsError, PARITY_BYTES};

/// Maximum RS chunk length; RS(255, 207) leaves 207 data bytes.
pub const MAX_CHUNK_LEN: usize = 207;

/// Maximum number of recoverable fragments.
pub const MAX_FEC: u32 = 5;

/// Payload bound for unprotected fragmentation. Ethernet MTU minus a
/// margin for tunnel encapsulations.
const MTU_PAYLOAD: usize = 1400;

#[derive(Debug, Error)]
pub enum PftError {
    #[error("chunk length {0} out of range 1..=207")]
    BadChunkLen(usize),

    #[error("fec {0} out of range 0..=5")]
    BadFec(u32),

    #[error("Reed-Solomon: {0}")]
    Rs(#[from] RsError),
}

/// Per-destination PFT configuration.
#[derive(Debug, Clone)]
pub struct PftSettings {
    pub enable_pft: bool,
    /// Number of fragments that may be lost and still recovered.
    pub fec: u32,
    /// RS chunk length k, at most 207.
    pub chunk_len: usize,
    /// Spread transmission of one AF packet's fragments over
    /// `factor × 24 ms`; values above 1.0 interleave consecutive packets.
    pub fragment_spreading_factor: f64,
    /// Destination address carried in the PF header when addressing is
    /// enabled.
    pub dest_port: u16,
    pub verbose: bool,
}

impl Default for PftSettings {
    fn default() -> Self {
        PftSettings {
            enable_pft: false,
            fec: 0,
            chunk_len: MAX_CHUNK_LEN,
            fragment_spreading_factor: 0.95,
            dest_port: 0,
            verbose: false,
        }
    }
}

impl PftSettings {
    pub fn validate(&self) -> Result<(), PftError> {
        if self.chunk_len == 0 || self.chunk_len > MAX_CHUNK_LEN {
            return Err(PftError::BadChunkLen(self.chunk_len));
        }
        if self.fec > MAX_FEC {
            return Err(PftError::BadFec(self.fec));
        }
        Ok(())
    }
}

/// PFT assembler for one destination; owns the Pseq counter.
pub struct Pft {
    settings: PftSettings,
    rs: ReedSolomon,
    pseq: u16,
}

impl std::fmt::Debug for Pft {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pft")
            .field("settings", &self.settings)
            .field("pseq", &self.pseq)
            .finish()
    }
}

impl Pft {
    pub fn new(settings: PftSettings) -> Result<Self, PftError> {
        settings.validate()?;
        let rs = ReedSolomon::new(255, 255 - PARITY_BYTES)?;
        Ok(Pft {
            settings,
            rs,
            pseq: 0,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enable_pft
    }

    pub fn spreading_factor(&self) -> f64 {
        self.settings.fragment_spreading_factor
    }

    /// Force the next Pseq; increments resume from the set value.
    pub fn override_pseq(&mut self, pseq: u16) {
        self.pseq = pseq;
    }

    /// TS 102 821 7.2.2: c = ceil(l / k_max), k = ceil(l / c).
    fn chunk_geometry(&self, af_len: usize) -> (usize, usize, usize) {
        let num_chunks = ceil_div(af_len, self.settings.chunk_len);
        let chunk_len = ceil_div(af_len, num_chunks);
        let zero_pad = num_chunks * chunk_len - af_len;
        (num_chunks, chunk_len, zero_pad)
    }

    /// Append 48 parity bytes to every chunk of the AF packet.
    fn protect(&self, af_packet: &[u8]) -> Result<Vec<u8>, PftError> {
        let (num_chunks, chunk_len, zero_pad) = self.chunk_geometry(af_packet.len());

        let mut padded = af_packet.to_vec();
        padded.resize(padded.len() + zero_pad, 0);

        let mut rs_block = Vec::with_capacity(num_chunks * (chunk_len + PARITY_BYTES));
        for chunk in padded.chunks(chunk_len) {
            // The RS code is always (255, 207); the chunk is padded at the
            // end up to 207 bytes and the padding is not transmitted.
            let mut data = [0u8; MAX_CHUNK_LEN];
            data[..chunk.len()].copy_from_slice(chunk);
            let parity = self.rs.encode(&data)?;

            rs_block.extend_from_slice(chunk);
            rs_block.extend_from_slice(&parity);
        }
        Ok(rs_block)
    }

    /// Cut the protected block into fragments, column-wise so each
    /// fragment takes bytes `num_fragments` apart.
    fn protect_and_fragment(&self, af_packet: &[u8]) -> Result<Vec<Vec<u8>>, PftError> {
        if self.settings.fec > 0 {
            let rs_block = self.protect(af_packet)?;
            let (num_chunks, _, _) = self.chunk_geometry(af_packet.len());

            // TS 102 821 7.2.2: s_max = floor(c*p / (m+1))
            let max_payload = num_chunks * PARITY_BYTES / (self.settings.fec as usize + 1);
            let num_fragments = ceil_div(rs_block.len(), max_payload);
            let fragment_size = ceil_div(rs_block.len(), num_fragments);

            let mut fragments = vec![vec![0u8; fragment_size]; num_fragments];
            for (i, fragment) in fragments.iter_mut().enumerate() {
                for (j, byte) in fragment.iter_mut().enumerate() {
                    let ix = j * num_fragments + i;
                    if ix < rs_block.len() {
                        *byte = rs_block[ix];
                    }
                }
            }
            Ok(fragments)
        } else {
            let num_fragments = ceil_div(af_packet.len(), MTU_PAYLOAD);
            let fragment_size = ceil_div(af_packet.len(), num_fragments);
            Ok(af_packet
                .chunks(fragment_size)
                .map(|c| c.to_vec())
                .collect())
        }
    }

    /// Produce the PF packets for one AF packet and advance Pseq.
    pub fn assemble(&mut self, af_packet: &[u8]) -> Result<Vec<Vec<u8>>, PftError> {
        let fragments = self.protect_and_fragment(af_packet)?;
        let enable_rs = self.settings.fec > 0;

        let (_, chunk_len, zero_pad) = if enable_rs {
            self.chunk_geometry(af_packet.len())
        } else {
            (0, 0, 0)
        };

        let fcount = fragments.len() as u32;
        let mut pft_fragments = Vec::with_capacity(fragments.len());

        for (findex, fragment) in fragments.iter().enumerate() {
            let mut packet = b"PF".to_vec();

            packet.extend_from_slice(&self.pseq.to_be_bytes());

            let findex = findex as u32;
            packet.push((findex >> 16) as u8);
            packet.push((findex >> 8) as u8);
            packet.push(findex as u8);

            packet.push((fcount >> 16) as u8);
            packet.push((fcount >> 8) as u8);
            packet.push(fcount as u8);

            let mut plen = fragment.len() as u16;
            if enable_rs {
                plen |= 0x8000; // FEC flag
            }
            plen |= 0x4000; // ADDR flag, source/dest always carried
            packet.extend_from_slice(&plen.to_be_bytes());

            if enable_rs {
                packet.push(chunk_len as u8); // RSk
                packet.push(zero_pad as u8); // RSz
            }

            // Source and dest addresses
            packet.extend_from_slice(&0u16.to_be_bytes());
            packet.extend_from_slice(&self.settings.dest_port.to_be_bytes());

            let crc = calc_crc16_ccitt(&packet);
            packet.extend_from_slice(&crc.to_be_bytes());

            packet.extend_from_slice(fragment);
            pft_fragments.push(packet);
        }

        self.pseq = self.pseq.wrapping_add(1);
        Ok(pft_fragments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(chunk_len: usize, fec: u32) -> PftSettings {
        PftSettings {
            enable_pft: true,
            fec,
            chunk_len,
            dest_port: 12000,
            ..PftSettings::default()
        }
    }

    fn sample_af(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i as u32 * 13 + 7) as u8).collect()
    }

    #[test]
    fn fragment_geometry_for_500_byte_packet() {
        // Worked example: l=500, k=207, m=1
        let mut pft = Pft::new(settings(207, 1)).unwrap();
        let af = sample_af(500);

        let (num_chunks, chunk_len, zero_pad) = pft.chunk_geometry(af.len());
        assert_eq!(num_chunks, 3);
        assert_eq!(chunk_len, 167);
        assert_eq!(zero_pad, 1);

        let rs_block = pft.protect(&af).unwrap();
        assert_eq!(rs_block.len(), 3 * (167 + 48));

        let fragments = pft.assemble(&af).unwrap();
        assert_eq!(fragments.len(), 9);
        for fragment in &fragments {
            // 12 byte header + RSk/RSz + addresses + CRC, then 72 payload
            assert_eq!(fragment.len(), 10 + 2 + 2 + 4 + 2 + 72);
        }
    }

    #[test]
    fn header_fields_and_crc() {
        let mut pft = Pft::new(settings(207, 1)).unwrap();
        let fragments = pft.assemble(&sample_af(500)).unwrap();

        for (i, fragment) in fragments.iter().enumerate() {
            assert_eq!(&fragment[0..2], b"PF");
            assert_eq!(u16::from_be_bytes([fragment[2], fragment[3]]), 0);
            let findex = u32::from_be_bytes([0, fragment[4], fragment[5], fragment[6]]);
            let fcount = u32::from_be_bytes([0, fragment[7], fragment[8], fragment[9]]);
            assert_eq!(findex, i as u32);
            assert_eq!(fcount, 9);

            let plen = u16::from_be_bytes([fragment[10], fragment[11]]);
            assert_eq!(plen & 0x8000, 0x8000, "FEC flag");
            assert_eq!(plen & 0x4000, 0x4000, "ADDR flag");
            assert_eq!(plen & 0x3FFF, 72);

            assert_eq!(fragment[12], 167); // RSk
            assert_eq!(fragment[13], 1); // RSz
            assert_eq!(u16::from_be_bytes([fragment[16], fragment[17]]), 12000);

            let crc = u16::from_be_bytes([fragment[18], fragment[19]]);
            assert_eq!(crc, calc_crc16_ccitt(&fragment[..18]));
        }

        // Pseq advanced once per AF packet
        let next = pft.assemble(&sample_af(500)).unwrap();
        assert_eq!(u16::from_be_bytes([next[0][2], next[0][3]]), 1);
    }

    #[test]
    fn no_rs_path_uses_mtu_fragments() {
        let mut pft = Pft::new(settings(207, 0)).unwrap();
        let af = sample_af(3000);
        let fragments = pft.assemble(&af).unwrap();

        // ceil(3000/1400) = 3 fragments of ceil(3000/3) = 1000 bytes
        assert_eq!(fragments.len(), 3);
        let plen = u16::from_be_bytes([fragments[0][10], fragments[0][11]]);
        assert_eq!(plen & 0x8000, 0, "no FEC flag");
        assert_eq!(plen & 0x3FFF, 1000);
        // no RSk/RSz: addresses follow the Plen directly
        assert_eq!(
            u16::from_be_bytes([fragments[0][14], fragments[0][15]]),
            12000
        );
    }

    #[test]
    fn config_limits_enforced() {
        assert!(Pft::new(settings(208, 1)).is_err());
        assert!(Pft::new(settings(0, 1)).is_err());
        assert!(Pft::new(settings(207, 6)).is_err());
    }

    /// Erase up to `fec` fragments and reconstruct the AF packet through
    /// the erasure decoder, byte for byte.
    #[test]
    fn protection_round_trip_with_erasures() {
        for (af_len, chunk, fec, erased) in [
            (500usize, 207usize, 1u32, vec![4usize]),
            (500, 207, 2, vec![0, 7]),
            (1000, 100, 3, vec![1, 2, 3]),
            (207, 207, 1, vec![0]),
        ] {
            let mut pft = Pft::new(settings(chunk, fec)).unwrap();
            let af = sample_af(af_len);

            let (num_chunks, chunk_len, _) = pft.chunk_geometry(af.len());
            let fragments = pft.assemble(&af).unwrap();
            let num_fragments = fragments.len();
            assert!(erased.len() <= fec as usize);

            // Receiver side: place surviving payloads column-wise back
            // into the RS block.
            let fragment_size = fragments[0].len() - 20;
            let rs_block_len = num_chunks * (chunk_len + PARITY_BYTES);
            let mut rs_block = vec![0u8; num_fragments * fragment_size];
            let mut missing = vec![false; rs_block.len()];

            for (i, fragment) in fragments.iter().enumerate() {
                let payload = &fragment[20..];
                for (j, &byte) in payload.iter().enumerate() {
                    let ix = j * num_fragments + i;
                    if erased.contains(&i) {
                        missing[ix] = true;
                    } else {
                        rs_block[ix] = byte;
                    }
                }
            }

            // Decode each chunk as a shortened RS(255, 207) codeword.
            let rs = ReedSolomon::new(255, 207).unwrap();
            let mut recovered = Vec::new();
            for c in 0..num_chunks {
                let base = c * (chunk_len + PARITY_BYTES);
                let mut codeword = [0u8; 255];
                let mut erasures = Vec::new();

                for off in 0..chunk_len + PARITY_BYTES {
                    let cw_pos = if off < chunk_len { off } else { 207 + off - chunk_len };
                    let ix = base + off;
                    if ix < rs_block_len {
                        if missing[ix] {
                            erasures.push(cw_pos);
                        } else {
                            codeword[cw_pos] = rs_block[ix];
                        }
                    }
                }

                rs.decode_erasures(&mut codeword, &erasures).unwrap();
                recovered.extend_from_slice(&codeword[..chunk_len]);
            }

            recovered.truncate(af.len());
            assert_eq!(recovered, af, "af_len={} fec={}", af_len, fec);
        }
    }
}
