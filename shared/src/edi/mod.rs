//! EDI output per ETSI TS 102 821 / TS 102 693: TAG items assembled into
//! AF packets, optionally protected and fragmented (PFT), transmitted over
//! UDP or TCP with time-spread scheduling.

pub mod afpacket;
pub mod pft;
pub mod rs;
pub mod tagitems;
pub mod tagpacket;
pub mod transport;

pub use afpacket::AfPacketiser;
pub use pft::{Pft, PftError, PftSettings};
pub use tagpacket::TagPacket;
pub use transport::{
    Configuration, Destination, DestinationConfig, Sender, TcpClientDestination, TcpDispatcher,
    TcpServerDestination, TransportError, UdpDestination,
};
