//! Finds Weed plugins, checks them the way the host would and lists the
//! filters they provide.

mod report;
mod scan;

pub use report::*;
pub use scan::*;
