use std::thread;
use weed::{InitFlags, Weed, WEED_ABI_VERSION};

fn main() {
  let weed = Weed::init(WEED_ABI_VERSION, InitFlags::empty()).unwrap();
  let funcs = weed.plugin_funcs();

  let p = weed.new_plant(1).unwrap();
  p.set_string("arg", "Hello").unwrap();
  p.set_boolean("done", false).unwrap();

  thread::scope(|s| {
    s.spawn(|| {
      let arg = p.get_string("arg").unwrap();
      p.set_string("result", &(arg + ", world!")).unwrap();
      p.set_boolean("done", true).unwrap();
    });

    while !p.get_boolean("done").unwrap() {}
  });

  println!("{}", p.get_string("result").unwrap());
  println!("{:?}", (funcs.plant_list_leaves)(&p).unwrap());
  (funcs.plant_free)(&p).unwrap();
}
