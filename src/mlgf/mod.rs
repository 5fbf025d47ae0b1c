//! Multilevel grid files: multidimensional indexes over hashed keys.

mod index;
mod key;
pub(crate) mod page;
mod split;

pub(crate) use index::{DirFrame, MlgfIndex};
pub use key::{Extreme, KeyDesc, MAX_KEYS};
pub(crate) use split::{select_split_domain, split_directory_page, SplitDomain, SplitOutcome};
