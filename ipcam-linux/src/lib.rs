//! Linux host side of the IP camera family: daemon configuration, the embedded HTTP
//! listener and the media proxy bridge. Hubs that embed the family call
//! [`bridge::spawn_outbound`] with the requests returned by `Peer::set_value`.

pub mod bridge;
pub mod config;
pub mod server;
