#[macro_use]
extern crate num_derive;

pub mod buffer;
pub mod cache;
pub mod channel;
pub mod chart;
pub mod codec;
pub mod error;
pub mod lvc;
pub mod mmap;
pub mod pump;
pub mod schema;
pub mod socket;
pub mod tape;
pub mod util;
