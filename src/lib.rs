pub mod capture;
pub mod cli;
pub mod config;
pub mod error;
pub mod extract;
pub mod igmp;
pub mod packet;
pub mod pcap;
pub mod transmit;
pub mod validate;
