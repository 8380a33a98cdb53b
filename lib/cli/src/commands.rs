//! The commands available in the `ofs-loader` binary.
mod cache;
mod describe;
mod resolve;

pub use self::{cache::*, describe::*, resolve::*};
