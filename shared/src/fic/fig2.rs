//! FIG type 2: extended (UTF-8) labels, transmitted in segments of up to 16
//! bytes. The first segment of a label carries the extended label header
//! with the segment count and character flag; the toggle flag inverts
//! whenever the label text changes.

use std::collections::BTreeMap;

use super::{FigContext, FillStatus};

/// Segment store for one label. Reloading with unchanged text keeps the
/// toggle flag; a changed text inverts it.
#[derive(Debug, Default)]
pub struct Fig2Segments {
    segments: Vec<Vec<u8>>,
    cursor: usize,
    text_on_last_load: String,
    toggle: bool,
}

impl Fig2Segments {
    pub fn load(&mut self, label: &str) {
        if label != self.text_on_last_load {
            self.toggle = !self.toggle;
            self.text_on_last_load = label.to_owned();
        }

        self.segments = label
            .as_bytes()
            .chunks(16)
            .map(|chunk| chunk.to_vec())
            .collect();
        self.cursor = 0;
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.cursor = 0;
    }

    pub fn ready(&self) -> bool {
        !self.segments.is_empty()
    }

    pub fn complete(&self) -> bool {
        !self.segments.is_empty() && self.cursor >= self.segments.len()
    }

    /// SegmentCount field: number of segments minus one.
    pub fn segment_count(&self) -> usize {
        self.segments.len().saturating_sub(1)
    }

    pub fn current_index(&self) -> usize {
        self.cursor
    }

    pub fn current_len(&self) -> usize {
        self.segments.get(self.cursor).map(Vec::len).unwrap_or(0)
    }

    pub fn toggle_flag(&self) -> bool {
        self.toggle
    }

    pub fn advance(&mut self) -> Vec<u8> {
        match self.segments.get(self.cursor) {
            Some(seg) => {
                self.cursor += 1;
                seg.clone()
            }
            None => Vec::new(),
        }
    }
}

/// Write one FIG 2 for the current segment of `segments`. Returns the bytes
/// written, or 0 if it does not fit in `buf`.
fn write_fig2_segment(
    buf: &mut [u8],
    ext: u8,
    identifier: &[u8],
    segments: &mut Fig2Segments,
) -> usize {
    let first = segments.current_index() == 0;
    let required = 2 + identifier.len() + if first { 3 } else { 0 } + segments.current_len();

    if buf.len() < required {
        return 0;
    }

    buf[0] = (2 << 5) | ((required - 1) as u8 & 0x1F);
    buf[1] = ((segments.toggle_flag() as u8) << 7)
        | ((segments.current_index() as u8 & 0x07) << 4)
        | (ext & 0x07);

    let mut pos = 2;
    buf[pos..pos + identifier.len()].copy_from_slice(identifier);
    pos += identifier.len();

    if first {
        // Extended label header: EncodingFlag 0 is UTF-8, the character
        // flag 0xFF00 selects plain truncation for the short variant.
        buf[pos] = (segments.segment_count() as u8 & 0x07) << 4;
        buf[pos + 1] = 0xFF;
        buf[pos + 2] = 0x00;
        pos += 3;
    }

    let character_field = segments.advance();
    buf[pos..pos + character_field.len()].copy_from_slice(&character_field);
    pos + character_field.len()
}

/// FIG 2/0, ensemble label.
#[derive(Debug, Default)]
pub struct Fig2_0 {
    segments: Fig2Segments,
}

impl Fig2_0 {
    pub fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        let Some(long) = ctx.ensemble.label.long_label() else {
            return FillStatus {
                written: 0,
                complete: true,
            };
        };

        if !self.segments.ready() {
            self.segments.load(long);
        }

        let eid = ctx.ensemble.id.to_be_bytes();
        let written = write_fig2_segment(buf, 0, &eid, &mut self.segments);

        let mut complete = false;
        if self.segments.complete() {
            self.segments.clear();
            complete = true;
        }
        FillStatus { written, complete }
    }
}

/// FIG 2/1 (programme service labels) and FIG 2/5 (data service labels),
/// sharing the rotation logic the way the type 1 counterparts do.
#[derive(Debug)]
pub struct Fig2ServiceLabels {
    programme: bool,
    cursor: usize,
    segments: BTreeMap<u32, Fig2Segments>,
}

impl Fig2ServiceLabels {
    pub fn new(programme: bool) -> Self {
        Fig2ServiceLabels {
            programme,
            cursor: 0,
            segments: BTreeMap::new(),
        }
    }

    pub fn extension(&self) -> u8 {
        if self.programme {
            1
        } else {
            5
        }
    }

    pub fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        let services = &ctx.ensemble.services;
        let mut written = 0;
        let ext = self.extension();

        while self.cursor < services.len() {
            let service = &services[self.cursor];
            let is_programme = ctx.ensemble.service_is_programme(service);

            let long = match service.label.long_label() {
                Some(long) if is_programme == self.programme => long,
                _ => {
                    self.cursor += 1;
                    continue;
                }
            };

            let segments = self.segments.entry(service.id).or_default();
            if !segments.ready() {
                segments.load(long);
            }

            let identifier: Vec<u8> = if self.programme {
                (service.id as u16).to_be_bytes().to_vec()
            } else {
                service.id.to_be_bytes().to_vec()
            };

            let n = write_fig2_segment(&mut buf[written..], ext, &identifier, segments);
            if n == 0 {
                break;
            }
            written += n;

            if segments.complete() {
                segments.clear();
                self.cursor += 1;
            }
        }

        let mut complete = false;
        if self.cursor >= services.len() {
            self.cursor = 0;
            complete = true;
        }
        FillStatus { written, complete }
    }
}

/// FIG 2/4, service component label.
#[derive(Debug, Default)]
pub struct Fig2_4 {
    cursor: usize,
    segments: BTreeMap<(u32, u8), Fig2Segments>,
}

impl Fig2_4 {
    pub fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        let components = &ctx.ensemble.components;
        let mut written = 0;

        while self.cursor < components.len() {
            let component = &components[self.cursor];

            let Some(long) = component.label.long_label() else {
                self.cursor += 1;
                continue;
            };

            let is_programme = ctx
                .ensemble
                .get_service(component.service_id)
                .map(|s| ctx.ensemble.service_is_programme(s))
                .unwrap_or(true);

            let segments = self
                .segments
                .entry((component.service_id, component.scids))
                .or_default();
            if !segments.ready() {
                segments.load(long);
            }

            let mut identifier = Vec::with_capacity(5);
            if is_programme {
                identifier.push(component.scids & 0x0F);
                identifier.extend_from_slice(&(component.service_id as u16).to_be_bytes());
            } else {
                identifier.push(0x80 | (component.scids & 0x0F));
                identifier.extend_from_slice(&component.service_id.to_be_bytes());
            }

            let n = write_fig2_segment(&mut buf[written..], 4, &identifier, segments);
            if n == 0 {
                break;
            }
            written += n;

            if segments.complete() {
                segments.clear();
                self.cursor += 1;
            }
        }

        let mut complete = false;
        if self.cursor >= components.len() {
            self.cursor = 0;
            complete = true;
        }
        FillStatus { written, complete }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_segment_label() {
        // "Radio Français" is 15 UTF-8 bytes: one segment, SegmentCount 0
        let mut segments = Fig2Segments::default();
        segments.load("Radio Français");
        assert_eq!(segments.segment_count(), 0);
        assert_eq!(segments.current_index(), 0);

        let toggle = segments.toggle_flag();
        let seg = segments.advance();
        assert_eq!(seg.len(), 14 + 1);
        assert!(segments.complete());

        // reloading the same text keeps the toggle
        segments.load("Radio Français");
        assert_eq!(segments.toggle_flag(), toggle);
    }

    #[test]
    fn changed_label_inverts_toggle_and_resegments() {
        let mut segments = Fig2Segments::default();
        segments.load("Radio Français");
        let toggle = segments.toggle_flag();

        // 23 bytes: two segments, SegmentCount 1
        segments.load("Radio Svizzera Italiana");
        assert_eq!(segments.toggle_flag(), !toggle);
        assert_eq!(segments.segment_count(), 1);
        assert_eq!(segments.advance().len(), 16);
        assert_eq!(segments.advance().len(), 7);
        assert!(segments.complete());
    }

    #[test]
    fn first_segment_carries_extended_header() {
        let mut segments = Fig2Segments::default();
        segments.load("Radio Svizzera Italiana");

        let mut buf = [0u8; 30];
        let n = write_fig2_segment(&mut buf, 0, &0xABCDu16.to_be_bytes(), &mut segments);
        // header 2 + eid 2 + ext header 3 + 16 bytes
        assert_eq!(n, 23);
        assert_eq!(buf[0] >> 5, 2);
        assert_eq!((buf[0] & 0x1F) as usize, n - 1);
        // segment index 0, extension 0
        assert_eq!(buf[1] & 0x77, 0);
        assert_eq!(&buf[2..4], &[0xAB, 0xCD]);
        // SegmentCount 1 in the extended header, character flag 0xFF00
        assert_eq!(buf[4], 1 << 4);
        assert_eq!(&buf[5..7], &[0xFF, 0x00]);

        let mut buf2 = [0u8; 30];
        let n2 = write_fig2_segment(&mut buf2, 0, &0xABCDu16.to_be_bytes(), &mut segments);
        // second segment: no extended header
        assert_eq!(n2, 2 + 2 + 7);
        assert_eq!((buf2[1] >> 4) & 0x07, 1);
    }

    #[test]
    fn no_partial_write_when_buffer_too_small() {
        let mut segments = Fig2Segments::default();
        segments.load("Radio Svizzera Italiana");
        let mut buf = [0u8; 10];
        assert_eq!(
            write_fig2_segment(&mut buf, 0, &0xABCDu16.to_be_bytes(), &mut segments),
            0
        );
        assert_eq!(segments.current_index(), 0);
    }
}
