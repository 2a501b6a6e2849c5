#![allow(dead_code)]

mod error;
mod node;
mod path;
mod search;

pub use error::*;
pub use node::*;
pub use path::*;
pub use search::*;
