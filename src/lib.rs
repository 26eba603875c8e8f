//! Software RAID-1 storage stack: mirror devices built on top of a set of
//! storage backends, kept consistent across failures and restarts.
#![warn(missing_docs)]

extern crate bincode;
extern crate byteorder;
#[macro_use]
extern crate error_chain;
extern crate futures;
extern crate itertools;
extern crate libc;
#[macro_use]
extern crate log;
extern crate parking_lot;
#[cfg(test)]
extern crate quickcheck;
#[cfg(test)]
#[macro_use]
extern crate quickcheck_macros;
#[cfg(test)]
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate toml;
extern crate twox_hash;
extern crate unbytify;

pub mod checksum;
pub mod metadata;
pub mod mirror;
pub mod size;
pub mod vdev;

pub use self::mirror::{Balance, Configuration, Mirror};
