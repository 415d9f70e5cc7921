//! End-to-end checks over the library data path: carousel → ETI frame →
//! EDI AF packet, for a small DAB+ ensemble transmitting silence.

use std::time::Instant;

use shared::dab::{
    Component, Ensemble, InputDescriptor, Label, Protection, Service, Subchannel, SubchannelType,
};
use shared::edi::{tagitems, AfPacketiser, TagPacket};
use shared::eti::{self, MuxTime, SubchannelStream};
use shared::fic::{FigCarousel, FigContext, FIB_LEN};
use shared::utils::calc_crc16_ccitt;

fn test_ensemble() -> Ensemble {
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

/// (figtype, extension, data) triples of one FIB.
fn parse_fib(fib: &[u8]) -> Vec<(u8, u8, Vec<u8>)> {
    let mut figs = Vec::new();
    let mut offset = 0;
    while offset < 30 && fib[offset] != 0xFF {
        let figtype = fib[offset] >> 5;
        let length = (fib[offset] & 0x1F) as usize;
        assert!(offset + 1 + length <= 30, "FIG spans FIB boundary");
        let data = fib[offset + 1..offset + 1 + length].to_vec();
        let ext = match figtype {
            0 => data[0] & 0x1F,
            1 | 2 => data[0] & 0x07,
            other => panic!("unexpected FIG type {}", other),
        };
        figs.push((figtype, ext, data));
        offset += 1 + length;
    }
    figs
}

#[test]
fn silence_ensemble_properties() {
    let ensemble = test_ensemble();
    let mut carousel = FigCarousel::new();
    let mut time = MuxTime::init(0, 0, 1_700_000_000);
    let silence = vec![0u8; 96 * 8];

    let mut seen_fig0_1 = false;
    let mut seen_fig1_0 = false;
    let mut previous_fct: Option<u8> = None;
    let mut previous_time: Option<(i64, u32)> = None;

    // 42 frames cover one second, the rate-B window
    for frame_index in 0..42u64 {
        let ctx = FigContext {
            ensemble: &ensemble,
            current_frame: frame_index,
            unix_time: time.edi_time(),
            now: Instant::now(),
        };
        let fic = carousel.write_fibs(&ctx, eti::fibs_per_frame(ensemble.mode));
        assert_eq!(fic.len(), 96);

        let subch = &ensemble.subchannels[0];
        let streams = [SubchannelStream {
            id: subch.id,
            start_address: subch.start_address,
            tpl: subch.tpl(),
            data: &silence,
        }];

        let frame = eti::build_frame(
            ensemble.mode,
            frame_index,
            &streams,
            &fic,
            0xFFFF,
            time.tist(37),
        )
        .unwrap();

        // P1: exact frame size
        assert_eq!(frame.len(), 6144);

        // P6: FCT increments by one
        if let Some(previous) = previous_fct {
            assert_eq!(frame[4], (previous + 1) % 250);
        }
        previous_fct = Some(frame[4]);

        // P7: timestamps advance by exactly 24 ms
        let now = (time.edi_time(), time.tsta());
        if let Some(previous) = previous_time {
            let delta = (now.0 - previous.0) * 16_384_000 + now.1 as i64 - previous.1 as i64;
            assert_eq!(delta, 24 * 16_384);
        }
        previous_time = Some(now);

        let mut fig0_0_count = 0;
        for (fib_index, fib) in fic.chunks(FIB_LEN).enumerate() {
            // P2: every FIB passes its CRC
            let crc = u16::from_be_bytes([fib[30], fib[31]]);
            assert_eq!(crc, calc_crc16_ccitt(&fib[..30]));

            for (k, (figtype, ext, data)) in parse_fib(fib).iter().enumerate() {
                match (figtype, ext) {
                    (0, 0) => {
                        // P4: FIG 0/0 only ever first in FIB 0
                        fig0_0_count += 1;
                        assert_eq!(fib_index, 0);
                        assert_eq!(k, 0);
                        assert_eq!(&data[1..3], &[0xAB, 0xCD]);
                    }
                    (0, 1) => {
                        // S1: SubChId 1 at SAD 0, EEP 3-A, 96 CU
                        seen_fig0_1 = true;
                        assert_eq!(data[1] >> 2, 1);
                        assert_eq!(((data[1] & 0x03) as u16) << 8 | data[2] as u16, 0);
                        assert_eq!(data[3] & 0x80, 0x80, "long form");
                        assert_eq!((data[3] >> 4) & 0x07, 0, "option A");
                        assert_eq!((data[3] >> 2) & 0x03, 2, "level index 2");
                        assert_eq!(((data[3] & 0x03) as u16) << 8 | data[4] as u16, 96);
                    }
                    (1, 0) => {
                        // S1: the ensemble label arrives within a second
                        seen_fig1_0 = true;
                        assert_eq!(&data[1..3], &[0xAB, 0xCD]);
                        assert_eq!(&data[3..7], b"Test");
                        assert!(data[7..19].iter().all(|&b| b == b' '));
                    }
                    _ => {}
                }
            }
        }

        if frame_index % 4 == 0 {
            assert_eq!(fig0_0_count, 1, "frame {}", frame_index);
        } else {
            assert_eq!(fig0_0_count, 0, "frame {}", frame_index);
        }

        time.increment_timestamp();
    }

    assert!(seen_fig0_1);
    assert!(seen_fig1_0);
}

#[test]
fn af_packet_of_one_frame_decodes() {
    let ensemble = test_ensemble();
    let mut carousel = FigCarousel::new();
    let time = MuxTime::init(0, 0, 1_700_000_000);
    let silence = vec![0u8; 96 * 8];

    let ctx = FigContext {
        ensemble: &ensemble,
        current_frame: 0,
        unix_time: time.edi_time(),
        now: Instant::now(),
    };
    let fic = carousel.write_fibs(&ctx, 3);

    let mut tagpacket = TagPacket::new(8);
    tagpacket.push(tagitems::TagStarPtr::new("DETI").unwrap().assemble());

    let (utco, seconds) = time.edi_seconds(37);
    tagpacket.push(
        tagitems::TagDeti {
            atstf: true,
            ficf: true,
            rfudf: false,
            dlfc: 0,
            stat: 0xFF,
            mid: 1,
            fp: 0,
            mnsc: 0xFFFF,
            utco,
            seconds,
            tsta: time.tsta(),
            fic: fic.clone(),
            rfud: 0,
        }
        .assemble(),
    );

    let subch = &ensemble.subchannels[0];
    tagpacket.push(
        tagitems::TagEstN {
            id: 1,
            scid: subch.id,
            sad: subch.start_address,
            tpl: subch.tpl(),
            mst: silence.clone(),
        }
        .assemble()
        .unwrap(),
    );

    let mut packetiser = AfPacketiser::default();
    let af = packetiser.assemble(&tagpacket.assemble());

    // AF header
    assert_eq!(&af[0..2], b"AF");
    let payload_len = u32::from_be_bytes([af[2], af[3], af[4], af[5]]) as usize;
    assert_eq!(af.len(), payload_len + 12);
    assert_eq!(af[8] & 0x80, 0x80, "CRC flag");
    assert_eq!(af[8] & 0x7F, 0x10, "version 1.0");
    assert_eq!(af[9], b'T');

    let crc = u16::from_be_bytes([af[af.len() - 2], af[af.len() - 1]]);
    assert_eq!(crc, calc_crc16_ccitt(&af[..af.len() - 2]));
    assert_eq!(payload_len % 8, 0, "TAG packet aligned to 8 bytes");

    // Walk the TAG items the way a receiver does
    let mut names = Vec::new();
    let mut pos = 10;
    while pos + 8 <= 10 + payload_len {
        let name = &af[pos..pos + 4];
        let len_bits =
            u32::from_be_bytes([af[pos + 4], af[pos + 5], af[pos + 6], af[pos + 7]]) as usize;
        names.push(name.to_vec());
        pos += 8 + len_bits / 8;
    }

    assert_eq!(names[0], b"*ptr");
    assert_eq!(names[1], b"deti");
    assert_eq!(names[2], b"est\x01");

    // deti carries the 96 FIC bytes after the 6-byte header and the
    // 8-byte timestamp
    let deti_value = &af[10 + 16 + 8..];
    assert_eq!(&deti_value[2 + 4 + 8..2 + 4 + 8 + 96], fic.as_slice());
}
