//! FIG type 1: labels in EBU Latin, 16 characters plus the character flag
//! selecting the short variant.

use crate::dab::Label;

use super::{FigContext, FillStatus};

/// Write one FIG 1 with the given identifier field and label. Returns bytes
/// written, or 0 if the FIG does not fit.
fn write_fig1(buf: &mut [u8], ext: u8, identifier: &[u8], label: &Label) -> usize {
    let required = 2 + identifier.len() + 16 + 2;
    if buf.len() < required {
        return 0;
    }

    buf[0] = (1 << 5) | ((required - 1) as u8 & 0x1F);
    // charset 0 (EBU Latin), OE 0
    buf[1] = ext & 0x07;

    let mut pos = 2;
    buf[pos..pos + identifier.len()].copy_from_slice(identifier);
    pos += identifier.len();

    buf[pos..pos + 16].copy_from_slice(&label.ebu_bytes());
    pos += 16;

    buf[pos..pos + 2].copy_from_slice(&label.flag().to_be_bytes());
    pos + 2
}

/// FIG 1/0, ensemble label.
#[derive(Debug, Default)]
pub struct Fig1_0;

impl Fig1_0 {
    pub fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        let eid = ctx.ensemble.id.to_be_bytes();
        let written = write_fig1(buf, 0, &eid, &ctx.ensemble.label);
        FillStatus {
            written,
            complete: written > 0,
        }
    }
}

/// FIG 1/1 (programme service labels) and FIG 1/5 (data service labels).
#[derive(Debug)]
pub struct Fig1ServiceLabels {
    programme: bool,
    cursor: usize,
}

impl Fig1ServiceLabels {
    pub fn new(programme: bool) -> Self {
        Fig1ServiceLabels {
            programme,
            cursor: 0,
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

        while self.cursor < services.len() {
            let service = &services[self.cursor];
            let is_programme = ctx.ensemble.service_is_programme(service);

            if is_programme != self.programme || service.label.text().is_empty() {
                self.cursor += 1;
                continue;
            }

            let identifier: Vec<u8> = if self.programme {
                (service.id as u16).to_be_bytes().to_vec()
            } else {
                service.id.to_be_bytes().to_vec()
            };

            let n = write_fig1(
                &mut buf[written..],
                self.extension(),
                &identifier,
                &service.label,
            );
            if n == 0 {
                break;
            }
            written += n;
            self.cursor += 1;
        }

        let mut complete = false;
        if self.cursor >= services.len() {
            self.cursor = 0;
            complete = true;
        }
        FillStatus { written, complete }
    }
}

/// FIG 1/4, service component label.
#[derive(Debug, Default)]
pub struct Fig1_4 {
    cursor: usize,
}

impl Fig1_4 {
    pub fn fill(&mut self, ctx: &FigContext, buf: &mut [u8]) -> FillStatus {
        let components = &ctx.ensemble.components;
        let mut written = 0;

        while self.cursor < components.len() {
            let component = &components[self.cursor];

            if component.label.text().is_empty() {
                self.cursor += 1;
                continue;
            }

            let is_programme = ctx
                .ensemble
                .get_service(component.service_id)
                .map(|s| ctx.ensemble.service_is_programme(s))
                .unwrap_or(true);

            let mut identifier = Vec::with_capacity(5);
            if is_programme {
                identifier.push(component.scids & 0x0F);
                identifier.extend_from_slice(&(component.service_id as u16).to_be_bytes());
            } else {
                identifier.push(0x80 | (component.scids & 0x0F));
                identifier.extend_from_slice(&component.service_id.to_be_bytes());
            }

            let n = write_fig1(&mut buf[written..], 4, &identifier, &component.label);
            if n == 0 {
                break;
            }
            written += n;
            self.cursor += 1;
        }

        let mut complete = false;
        if self.cursor >= components.len() {
            self.cursor = 0;
            complete = true;
        }
        FillStatus { written, complete }
    }
}
