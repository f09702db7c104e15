//! This crate provides the plant/leaf attribute store: a small, dynamically
//! typed key to value-array container shared between a host application and
//! independently built plugins.
//!
//! A [`Plant`] is a chain of leaves. Each leaf has a string key, a fixed
//! [`SeedType`], a few [`LeafFlags`] and an array of [`Value`]s. Every plant
//! carries an immutable ```type``` leaf with a single integer. Plants are
//! shared between threads by reference; readers never wait behind writers of
//! other keys, and deleting a leaf never pulls it from under a reader.
//!
//! Hosts negotiate an ABI version with [`Weed::init`] and hand plugins the
//! resulting function table.
//!
//! ```
//! use weed::{InitFlags, Weed, WEED_ABI_VERSION};
//!
//! let weed = Weed::init(WEED_ABI_VERSION, InitFlags::empty()).unwrap();
//! let plant = weed.new_plant(1).unwrap();
//! plant.set_string("name", "blur").unwrap();
//! assert_eq!(plant.keys().unwrap(), vec!["type", "name"]);
//! plant.free().unwrap();
//! ```

pub mod abi;
pub mod error;
pub mod leaf;
pub mod plant;
pub mod values;

mod sync;

#[cfg(not(feature = "serde_support"))]
pub mod json_util;

#[cfg(test)]
mod plant_tests;

pub use crate::abi::*;
pub use crate::error::*;
pub use crate::leaf::{hash_key, LeafFlags, KEY_INLINE_LEN, LEAF_TYPE};
pub use crate::plant::Plant;
pub use crate::values::{SeedType, Value};
