//! Core library of the holyrood DAB ensemble multiplexer.
//!
//! The modules follow the data path of the multiplexer: the [`dab`] model
//! describes the ensemble, [`fic`] schedules FIGs into the Fast Information
//! Channel, [`eti`] assembles 24 ms ETI(NI) frames, [`edi`] wraps frames into
//! AF/PFT packets and ships them over UDP or TCP, and [`clock`] maintains the
//! TAI-UTC offset used for EDI timestamps.

pub mod clock;
pub mod dab;
pub mod edi;
pub mod eti;
pub mod fic;
pub mod utils;
