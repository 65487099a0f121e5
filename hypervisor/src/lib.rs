#![cfg_attr(not(test), no_std)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[macro_use] extern crate static_assertions;

pub mod boot;
pub mod config;
pub mod mm;
pub mod utils;
pub mod vm;
pub mod vpci;
