//! ABI negotiation and the function tables handed to plugins.
//!
//! The host calls [`Weed::init`] once at start-up. The resulting context is
//! read-only from then on and is passed to plugins by reference, or as the
//! plain [`WeedFuncs`] table from [`Weed::plugin_funcs`].

use core::ffi::c_void;
use core::fmt;

use crate::error::*;
use crate::leaf::LeafFlags;
use crate::plant::Plant;
use crate::values::{SeedType, Value};

/// Highest ABI version this crate implements.
pub const WEED_ABI_VERSION: i32 = 202;
/// Lowest ABI version this crate still serves.
pub const WEED_ABI_MIN_VERSION: i32 = 200;

bitflags::bitflags! {
  /// Options fixed at [`Weed::init`].
  #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
  pub struct InitFlags: u32 {
    /// Serve a newer requested ABI at [`WEED_ABI_VERSION`] instead of failing.
    const PERMISSIVE = 1 << 0;
    /// Plants created through the context log every operation at `debug`.
    const DEBUG = 1 << 1;
  }
}

/// The operations a plugin may call.
#[derive(Clone, Copy)]
pub struct WeedFuncs {
  pub plant_new: fn(i32) -> WeedResult<Plant>,
  pub plant_free: fn(&Plant) -> WeedResult<()>,
  pub plant_list_leaves: fn(&Plant) -> WeedResult<Vec<String>>,
  pub leaf_get: fn(&Plant, &str, usize) -> WeedResult<Value>,
  pub leaf_set: fn(&Plant, &str, SeedType, &[Value]) -> WeedResult<()>,
  pub leaf_num_elements: fn(&Plant, &str) -> usize,
  pub leaf_element_size: fn(&Plant, &str, usize) -> usize,
  pub leaf_seed_type: fn(&Plant, &str) -> SeedType,
  pub leaf_get_flags: fn(&Plant, &str) -> LeafFlags,
  pub leaf_delete: fn(&Plant, &str) -> WeedResult<()>,
}

/// The plugin table plus the operations reserved to the host.
#[derive(Clone, Copy)]
pub struct HostFuncs {
  pub plugin: WeedFuncs,
  pub leaf_set_flags: fn(&Plant, &str, LeafFlags) -> WeedResult<()>,
  pub leaf_get_private_data: fn(&Plant, &str) -> WeedResult<*mut c_void>,
  pub leaf_set_private_data: fn(&Plant, &str, *mut c_void) -> WeedResult<()>,
}

impl fmt::Debug for WeedFuncs {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WeedFuncs").finish_non_exhaustive()
  }
}

impl fmt::Debug for HostFuncs {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HostFuncs").field("plugin", &self.plugin).finish_non_exhaustive()
  }
}

fn plant_new_debug(plant_type: i32) -> WeedResult<Plant> {
  Plant::new_with(plant_type, true)
}

impl HostFuncs {
  fn new(flags: InitFlags) -> HostFuncs {
    let plant_new: fn(i32) -> WeedResult<Plant> =
      if flags.contains(InitFlags::DEBUG) { plant_new_debug } else { Plant::new };
    HostFuncs {
      plugin: WeedFuncs {
        plant_new,
        plant_free: Plant::free,
        plant_list_leaves: Plant::keys,
        leaf_get: Plant::get,
        leaf_set: Plant::set,
        leaf_num_elements: Plant::num_elements,
        leaf_element_size: Plant::element_size,
        leaf_seed_type: Plant::seed_type,
        leaf_get_flags: Plant::flags,
        leaf_delete: Plant::delete,
      },
      leaf_set_flags: Plant::set_flags,
      leaf_get_private_data: Plant::get_private_data,
      leaf_set_private_data: Plant::set_private_data,
    }
  }
}

/// The negotiated ABI version, start-up options and function table.
#[derive(Debug, Clone, Copy)]
pub struct Weed {
  abi: i32,
  flags: InitFlags,
  funcs: HostFuncs,
}

impl Weed {
  /// Negotiates ```abi``` and installs the function table. Call once at
  /// start-up, before any plant exists.
  pub fn init(abi: i32, flags: InitFlags) -> WeedResult<Weed> {
    if abi < WEED_ABI_MIN_VERSION {
      log::warn!("ABI {} is older than the oldest supported ({})", abi, WEED_ABI_MIN_VERSION);
      return Err(WeedError::BadVersion);
    }
    let abi = if abi > WEED_ABI_VERSION {
      if !flags.contains(InitFlags::PERMISSIVE) {
        log::warn!("ABI {} is newer than supported ({})", abi, WEED_ABI_VERSION);
        return Err(WeedError::BadVersion);
      }
      log::debug!("ABI {} requested, serving {}", abi, WEED_ABI_VERSION);
      WEED_ABI_VERSION
    } else {
      abi
    };
    if flags.contains(InitFlags::DEBUG) {
      log::debug!("weed initialised: ABI {}, flags {:?}", abi, flags);
    }
    Ok(Weed::with_version(abi, flags))
  }

  fn with_version(abi: i32, flags: InitFlags) -> Weed {
    Weed { abi, flags, funcs: HostFuncs::new(flags) }
  }

  pub fn get_abi_version(&self) -> i32 {
    self.abi
  }

  pub fn flags(&self) -> InitFlags {
    self.flags
  }

  /// The full host table.
  pub fn funcs(&self) -> &HostFuncs {
    &self.funcs
  }

  /// The table to hand to a plugin.
  pub fn plugin_funcs(&self) -> WeedFuncs {
    self.funcs.plugin
  }

  /// Creates a plant through the installed table.
  pub fn new_plant(&self, plant_type: i32) -> WeedResult<Plant> {
    (self.funcs.plugin.plant_new)(plant_type)
  }
}

impl Default for Weed {
  /// The newest ABI, no options.
  fn default() -> Self {
    Weed::with_version(WEED_ABI_VERSION, InitFlags::empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn negotiation() {
    assert_eq!(Weed::init(WEED_ABI_VERSION, InitFlags::empty()).unwrap().get_abi_version(), 202);
    assert_eq!(Weed::init(WEED_ABI_MIN_VERSION, InitFlags::empty()).unwrap().get_abi_version(), 200);
    assert_eq!(Weed::init(201, InitFlags::empty()).unwrap().get_abi_version(), 201);
    assert_eq!(Weed::init(199, InitFlags::empty()).unwrap_err(), WeedError::BadVersion);
    assert_eq!(Weed::init(203, InitFlags::empty()).unwrap_err(), WeedError::BadVersion);
    assert_eq!(Weed::init(199, InitFlags::PERMISSIVE).unwrap_err(), WeedError::BadVersion);
  }

  #[test]
  fn permissive_clamps_newer_abi() {
    let weed = Weed::init(250, InitFlags::PERMISSIVE).unwrap();
    assert_eq!(weed.get_abi_version(), WEED_ABI_VERSION);
    assert_eq!(weed.flags(), InitFlags::PERMISSIVE);
  }

  #[test]
  fn default_context() {
    let weed = Weed::default();
    assert_eq!(weed.get_abi_version(), WEED_ABI_VERSION);
    assert!(weed.flags().is_empty());
  }

  #[test]
  fn plugin_table_drives_a_plant() {
    let weed = Weed::default();
    let f = weed.plugin_funcs();
    let p = (f.plant_new)(3).unwrap();
    (f.leaf_set)(&p, "gain", SeedType::DOUBLE, &[Value::Double(0.5)]).unwrap();
    assert_eq!((f.leaf_get)(&p, "gain", 0), Ok(Value::Double(0.5)));
    assert_eq!((f.leaf_num_elements)(&p, "gain"), 1);
    assert_eq!((f.leaf_element_size)(&p, "gain", 0), 8);
    assert_eq!((f.leaf_seed_type)(&p, "gain"), SeedType::DOUBLE);
    assert_eq!((f.leaf_get_flags)(&p, "gain"), LeafFlags::empty());
    assert_eq!((f.plant_list_leaves)(&p).unwrap(), vec!["type", "gain"]);
    (f.leaf_delete)(&p, "gain").unwrap();
    assert_eq!((f.plant_free)(&p), Ok(()));
  }

  #[test]
  fn host_table_extras() {
    let weed = Weed::init(WEED_ABI_VERSION, InitFlags::DEBUG).unwrap();
    let p = weed.new_plant(1).unwrap();
    assert!(p.is_debug());
    let h = weed.funcs();
    (h.plugin.leaf_set)(&p, "x", SeedType::INT, &[Value::Int(1)]).unwrap();
    (h.leaf_set_flags)(&p, "x", LeafFlags::UNDELETABLE).unwrap();
    assert_eq!((h.plugin.leaf_delete)(&p, "x"), Err(WeedError::Undeletable));
    let mut word = 0u64;
    let ptr = &mut word as *mut u64 as *mut c_void;
    (h.leaf_set_private_data)(&p, "x", ptr).unwrap();
    assert_eq!((h.leaf_get_private_data)(&p, "x"), Ok(ptr));
  }

  #[test]
  fn plain_context_plants_are_quiet() {
    let p = Weed::default().new_plant(1).unwrap();
    assert!(!p.is_debug());
  }
}
