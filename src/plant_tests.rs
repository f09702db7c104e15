#![cfg(not(feature = "single_threaded"))]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Barrier;
use std::thread;

use crate::*;

const ROUNDS: i32 = 2000;

fn init_logger() {
  let _ = env_logger::builder().is_test(true).try_init();
}

fn int_array(n: i32) -> Vec<Value> {
  vec![Value::Int(n); (n % 8 + 1) as usize]
}

#[test]
fn readers_see_whole_arrays() {
  init_logger();
  let p = Plant::new(1).unwrap();
  p.set("k", SeedType::INT, &int_array(0)).unwrap();
  let done = AtomicBool::new(false);

  thread::scope(|s| {
    for _ in 0..4 {
      s.spawn(|| {
        while !done.load(Ordering::Relaxed) {
          let vals = p.get_array("k").unwrap();
          let first = vals[0].as_int().unwrap();
          assert_eq!(vals.len() as i32, first % 8 + 1);
          assert!(vals.iter().all(|v| *v == Value::Int(first)));
        }
      });
    }
    s.spawn(|| {
      for n in 1..ROUNDS {
        p.set("k", SeedType::INT, &int_array(n)).unwrap();
      }
      done.store(true, Ordering::Relaxed);
    });
  });
  assert_eq!(p.get_int("k"), Ok(ROUNDS - 1));
}

#[test]
fn delete_does_not_disturb_neighbours() {
  init_logger();
  let p = Plant::new(1).unwrap();
  p.set_int("a", 1).unwrap();
  p.set_string("b", "middle").unwrap();
  p.set_int("c", 3).unwrap();
  let done = AtomicBool::new(false);

  thread::scope(|s| {
    for _ in 0..3 {
      s.spawn(|| {
        while !done.load(Ordering::Relaxed) {
          assert_eq!(p.get_int("a"), Ok(1));
          assert_eq!(p.get_int("c"), Ok(3));
          match p.get("b", 0) {
            Ok(v) => assert_eq!(v, Value::String("middle".into())),
            Err(e) => assert_eq!(e, WeedError::NoSuchLeaf),
          }
        }
      });
    }
    s.spawn(|| {
      for _ in 0..ROUNDS {
        p.delete("b").unwrap();
        p.set_string("b", "middle").unwrap();
      }
      done.store(true, Ordering::Relaxed);
    });
  });
  assert_eq!(p.len(), 4);
}

#[test]
fn racing_inserts_create_one_leaf() {
  init_logger();
  for _ in 0..50 {
    let p = Plant::new(1).unwrap();
    thread::scope(|s| {
      for t in 0..8 {
        let p = &p;
        s.spawn(move || p.set_int("same", t).unwrap());
      }
    });
    assert_eq!(p.keys().unwrap(), vec!["type", "same"]);
  }
}

#[test]
fn racing_inserts_of_distinct_keys() {
  init_logger();
  let p = Plant::new(1).unwrap();
  thread::scope(|s| {
    for t in 0..8 {
      let p = &p;
      s.spawn(move || {
        for i in 0..100 {
          p.set_int(&format!("t{}_{}", t, i), i).unwrap();
        }
      });
    }
  });
  let keys = p.keys().unwrap();
  assert_eq!(keys.len(), 801);
  assert_eq!(keys[0], "type");
  let unique: HashSet<&String> = keys.iter().collect();
  assert_eq!(unique.len(), keys.len());
  assert_eq!(p.get_int("t7_99"), Ok(99));
}

#[test]
fn listing_is_consistent_under_churn() {
  init_logger();
  let p = Plant::new(1).unwrap();
  for k in ["stable1", "stable2", "stable3"] {
    p.set_int(k, 0).unwrap();
  }
  let done = AtomicBool::new(false);

  thread::scope(|s| {
    s.spawn(|| {
      while !done.load(Ordering::Relaxed) {
        let keys = p.keys().unwrap();
        assert_eq!(keys[0], "type");
        for k in ["stable1", "stable2", "stable3"] {
          assert!(keys.iter().any(|x| x == k));
        }
        let unique: HashSet<&String> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len());
      }
    });
    s.spawn(|| {
      for i in 0..ROUNDS {
        let k = format!("temp{}", i % 5);
        if p.has(&k) {
          p.delete(&k).unwrap();
        } else {
          p.set_double(&k, i as f64).unwrap();
        }
      }
      done.store(true, Ordering::Relaxed);
    });
  });
}

#[test]
fn immutable_flag_races_writers() {
  init_logger();
  let p = Plant::new(1).unwrap();
  p.set_int("x", 0).unwrap();
  thread::scope(|s| {
    for _ in 0..4 {
      s.spawn(|| {
        for i in 0..500 {
          match p.set_int("x", i) {
            Ok(()) | Err(WeedError::Immutable) => {}
            Err(e) => panic!("unexpected {:?}", e),
          }
        }
      });
    }
    s.spawn(|| {
      for i in 0..500 {
        let f = if i % 2 == 0 { LeafFlags::IMMUTABLE } else { LeafFlags::empty() };
        p.set_flags("x", f).unwrap();
      }
    });
  });
  p.set_flags("x", LeafFlags::IMMUTABLE).unwrap();
  let before = p.get_int("x");
  assert_eq!(p.set_int("x", -1), Err(WeedError::Immutable));
  assert_eq!(p.get_int("x"), before);
}

#[test]
fn free_while_reading() {
  init_logger();
  for _ in 0..20 {
    let p = Plant::new(5).unwrap();
    for i in 0..20 {
      p.set_int(&format!("k{}", i), i).unwrap();
    }
    thread::scope(|s| {
      for _ in 0..3 {
        s.spawn(|| {
          for _ in 0..200 {
            match p.get_int("k10") {
              Ok(v) => assert_eq!(v, 10),
              Err(e) => assert_eq!(e, WeedError::NoSuchLeaf),
            }
            let _ = p.keys().unwrap();
          }
        });
      }
      s.spawn(|| p.free().unwrap());
    });
    assert!(p.is_defunct());
    assert_eq!(p.keys().unwrap(), Vec::<String>::new());
  }
}

#[test]
fn free_spares_undeletable_leaves_under_load() {
  init_logger();
  let p = Plant::new(2).unwrap();
  for i in 0..10 {
    p.set_int(&format!("k{}", i), i).unwrap();
  }
  p.set_flags("k3", LeafFlags::UNDELETABLE).unwrap();
  p.set_flags("k7", LeafFlags::UNDELETABLE).unwrap();

  thread::scope(|s| {
    s.spawn(|| {
      for _ in 0..500 {
        assert_eq!(p.get_int("k3"), Ok(3));
        assert_eq!(p.get_int("k7"), Ok(7));
      }
    });
    s.spawn(|| assert_eq!(p.free(), Err(WeedError::Undeletable)));
  });

  let mut keys = p.keys().unwrap();
  keys.sort();
  assert_eq!(keys, vec!["k3", "k7", "type"]);
  p.set_flags("k3", LeafFlags::empty()).unwrap();
  p.set_flags("k7", LeafFlags::empty()).unwrap();
  assert_eq!(p.free(), Ok(()));
}

#[test]
fn undeletable_flag_racing_delete() {
  init_logger();
  let p = Plant::new(1).unwrap();
  let start = Barrier::new(2);
  for i in 0..ROUNDS {
    if p.has("x") {
      p.set_flags("x", LeafFlags::empty()).unwrap();
      p.delete("x").unwrap();
    }
    p.set_int("x", i).unwrap();

    let (deleted, flagged) = thread::scope(|s| {
      let d = s.spawn(|| {
        start.wait();
        p.delete("x")
      });
      let f = s.spawn(|| {
        start.wait();
        p.set_flags("x", LeafFlags::UNDELETABLE)
      });
      (d.join().unwrap(), f.join().unwrap())
    });

    match (deleted, flagged) {
      (Ok(()), Err(WeedError::NoSuchLeaf)) => assert!(!p.has("x")),
      (Err(WeedError::Undeletable), Ok(())) => {
        assert_eq!(p.get_int("x"), Ok(i));
        assert_eq!(p.flags("x"), LeafFlags::UNDELETABLE);
      }
      other => panic!("delete and set_flags disagree: {:?}", other),
    }
  }
}

#[test]
fn undeletable_flag_racing_free() {
  init_logger();
  let start = Barrier::new(2);
  for _ in 0..500 {
    let p = Plant::new(1).unwrap();
    p.set_int("a", 1).unwrap();
    p.set_int("x", 2).unwrap();

    let (freed, flagged) = thread::scope(|s| {
      let fr = s.spawn(|| {
        start.wait();
        p.free()
      });
      let f = s.spawn(|| {
        start.wait();
        p.set_flags("x", LeafFlags::UNDELETABLE)
      });
      (fr.join().unwrap(), f.join().unwrap())
    });

    match (freed, flagged) {
      (Ok(()), Err(WeedError::NoSuchLeaf)) => assert!(p.is_defunct()),
      (Err(WeedError::Undeletable), Ok(())) => {
        assert_eq!(p.get_int("x"), Ok(2));
        assert!(!p.has("a"));
      }
      other => panic!("free and set_flags disagree: {:?}", other),
    }
  }
}
