#![deny(dead_code)]
#![deny(unused_imports)]

pub mod checkpoint;
pub mod data;
pub mod driver;
pub mod engine;
pub mod family;
pub mod gp;
pub mod hyper;
pub mod orchestrate;
pub mod sampler;
pub mod search;
