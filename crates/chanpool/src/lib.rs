#![doc = include_str!("../README.md")]

mod connection;
mod dial;
mod error;
mod pool;

#[cfg(test)]
mod mock;

pub use crate::connection::*;
pub use crate::dial::*;
pub use crate::error::*;
pub use crate::pool::*;
